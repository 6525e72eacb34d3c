//! Scoped ownership of a per-request rendered file.

use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};

/// Removes its file on [`cleanup`](TempArtifact::cleanup) or, failing that,
/// on drop. Removing an already-missing file is not an error.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    released: bool,
}

impl TempArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Delete the file. Safe to call more than once.
    pub async fn cleanup(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!("removed temporary render {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed temporary render {} on drop", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove temporary render {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}
