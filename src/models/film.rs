//! A film row and the playable asset resolved from it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;

/// A film as stored in the catalogue's `films` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Film {
    /// Primary key, also the stream asset id.
    pub id: i64,

    /// Display title, used for the download filename.
    pub title: String,

    pub description: String,

    pub release_date: Option<NaiveDate>,

    /// Running time in minutes (informational only).
    pub duration: i64,

    /// Location of the video file, absolute or relative to the media root.
    pub video_path: Option<String>,
}

/// A film whose backing file was found on disk at lookup time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaAsset {
    pub id: i64,
    pub title: String,
    pub path: PathBuf,
    pub duration_minutes: i64,
    pub size_bytes: u64,
}
