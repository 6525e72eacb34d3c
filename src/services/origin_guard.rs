//! Hot-link protection: only requests declaring a trusted front-end origin
//! may stream.

/// Allow-list of trusted origins, matched as prefixes of the `Referer`
/// (or `Origin`) header value.
#[derive(Debug, Clone, Default)]
pub struct OriginGuard {
    allowed: Vec<String>,
}

impl OriginGuard {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed = allowed
            .into_iter()
            .map(Into::into)
            .map(|s: String| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { allowed }
    }

    /// Returns true when `origin` is present and matches an allow-list entry.
    ///
    /// A missing or blank header never matches.
    pub fn allow(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) else {
            return false;
        };
        self.allowed
            .iter()
            .any(|entry| matches_entry(origin, entry))
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}

/// Prefix match that must end on a URL boundary, so `http://host:3000`
/// does not admit `http://host:3000.attacker.example`.
fn matches_entry(origin: &str, entry: &str) -> bool {
    match origin.strip_prefix(entry) {
        Some("") => true,
        Some(rest) => entry.ends_with('/') || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> OriginGuard {
        OriginGuard::new(["http://localhost:3000"])
    }

    #[test]
    fn exact_and_path_referers_are_allowed() {
        let guard = guard();
        assert!(guard.allow(Some("http://localhost:3000")));
        assert!(guard.allow(Some("http://localhost:3000/")));
        assert!(guard.allow(Some("http://localhost:3000/films/42?autoplay=1")));
    }

    #[test]
    fn missing_or_blank_header_fails_closed() {
        let guard = guard();
        assert!(!guard.allow(None));
        assert!(!guard.allow(Some("")));
        assert!(!guard.allow(Some("   ")));
    }

    #[test]
    fn foreign_and_lookalike_origins_are_rejected() {
        let guard = guard();
        assert!(!guard.allow(Some("http://malicious.example")));
        assert!(!guard.allow(Some("http://localhost:30001")));
        assert!(!guard.allow(Some("http://localhost:3000.malicious.example")));
        assert!(!guard.allow(Some("https://localhost:3000")));
    }

    #[test]
    fn entry_with_trailing_slash_matches_everything_below_it() {
        let guard = OriginGuard::new(["https://films.example/app/"]);
        assert!(guard.allow(Some("https://films.example/app/player")));
        assert!(!guard.allow(Some("https://films.example/other")));
    }

    #[test]
    fn empty_allow_list_rejects_everything() {
        let guard = OriginGuard::new(Vec::<String>::new());
        assert!(!guard.allow(Some("http://localhost:3000")));
        let blank = OriginGuard::new(["", "  "]);
        assert!(blank.allowed().is_empty());
    }
}
