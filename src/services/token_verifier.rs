//! Bearer credential verification for stream requests.
//!
//! Tokens are compact JWTs issued by the external identity component. This
//! module only decodes them: the signature, `exp` and (when present)
//! `token_type` are checked and the subject is extracted. Failures are
//! reported as a value, never as an error, so callers pick the policy.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::{fmt, str::FromStr};
use tracing::debug;

/// What to do with a stream request whose token is missing or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPolicy {
    /// Serve the video with the fallback watermark label.
    #[default]
    Lenient,
    /// Reject the request with 401.
    Strict,
}

impl FromStr for TokenPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(TokenPolicy::Lenient),
            "strict" => Ok(TokenPolicy::Strict),
            other => Err(format!(
                "unknown token policy `{}` (expected `lenient` or `strict`)",
                other
            )),
        }
    }
}

/// Subject identifier as found in the `user_id` claim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SubjectId {
    Int(i64),
    Str(String),
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectId::Int(id) => write!(f, "{}", id),
            SubjectId::Str(id) => f.write_str(id),
        }
    }
}

/// Claims this service reads from an access token. Extra claims are ignored.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub user_id: SubjectId,
    /// Expiry (seconds since epoch).
    pub exp: i64,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// A token that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`TokenVerifier::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    Valid(VerifiedToken),
    Invalid(String),
}

impl TokenCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenCheck::Valid(_))
    }
}

/// Stateless verifier bound to the process-wide signing secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, algorithm: Algorithm, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify `token` and extract its subject.
    pub fn verify(&self, token: &str) -> TokenCheck {
        match self.check(token) {
            Ok(verified) => TokenCheck::Valid(verified),
            Err(reason) => {
                debug!(%reason, "stream token rejected");
                TokenCheck::Invalid(reason)
            }
        }
    }

    fn check(&self, token: &str) -> Result<VerifiedToken, String> {
        if token.trim().is_empty() {
            return Err("empty token".to_owned());
        }

        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| format!("invalid token: {e}"))?
            .claims;

        if let Some(kind) = claims.token_type.as_deref() {
            if kind != "access" {
                return Err(format!("token type `{kind}` cannot be used for streaming"));
            }
        }

        let subject_id = claims.user_id.to_string();
        if subject_id.trim().is_empty() {
            return Err("token carries an empty subject".to_owned());
        }

        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| format!("expiry {} is out of range", claims.exp))?;

        Ok(VerifiedToken {
            subject_id,
            expires_at,
        })
    }
}
