//! MediaLocator: maps a film id to the video file backing it.
//!
//! Film metadata lives in SQLite and is owned by the catalogue backend. A row
//! may point at a file that has since disappeared from storage; that is
//! reported separately from a missing row so operators can spot the drift.

use crate::{
    models::film::{Film, MediaAsset},
    services::stream_service::{StreamError, StreamResult},
};
use sqlx::SqlitePool;
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::error;

#[derive(Clone)]
pub struct MediaLocator {
    /// Shared SQLite connection pool holding the `films` table.
    pub db: Arc<SqlitePool>,

    /// Directory relative `video_path` values are resolved against.
    pub media_root: PathBuf,
}

impl MediaLocator {
    pub fn new(db: Arc<SqlitePool>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            media_root: media_root.into(),
        }
    }

    /// Fetch the film row. Returns AssetNotFound if missing.
    pub async fn fetch_film(&self, id: i64) -> StreamResult<Film> {
        sqlx::query_as::<_, Film>(
            "SELECT id, title, description, release_date, duration, video_path
             FROM films WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StreamError::AssetNotFound(id.to_string()))
    }

    /// Resolve a film id to a playable asset.
    ///
    /// The path must name an existing regular file; otherwise the lookup
    /// fails with SourceFileMissing.
    pub async fn resolve(&self, id: i64) -> StreamResult<MediaAsset> {
        let film = self.fetch_film(id).await?;

        let Some(path) = film
            .video_path
            .as_deref()
            .and_then(|stored| self.resolve_path(stored))
        else {
            error!(film_id = id, "film has no usable video path");
            return Err(StreamError::SourceFileMissing(id));
        };

        let size_bytes = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                error!(film_id = id, path = %path.display(), "video path is not a regular file");
                return Err(StreamError::SourceFileMissing(id));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                error!(film_id = id, path = %path.display(), "video file missing from storage");
                return Err(StreamError::SourceFileMissing(id));
            }
            Err(err) => return Err(StreamError::Io(err)),
        };

        Ok(MediaAsset {
            id: film.id,
            title: film.title,
            path,
            duration_minutes: film.duration,
            size_bytes,
        })
    }

    /// Absolute paths are taken as stored. Relative ones are joined onto the
    /// media root and may not climb out of it.
    fn resolve_path(&self, stored: &str) -> Option<PathBuf> {
        let stored = stored.trim();
        if stored.is_empty() {
            return None;
        }
        let candidate = Path::new(stored);
        if candidate.is_absolute() {
            return Some(candidate.to_path_buf());
        }
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return None;
        }
        Some(self.media_root.join(candidate))
    }
}
