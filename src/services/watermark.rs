//! Per-viewer watermark rendering.
//!
//! The label is burned into the bottom-right corner of every frame by an
//! `ffmpeg` child process. Video is re-encoded with libx264, audio is copied
//! through untouched. Output always goes to a fresh per-request path under
//! the temp directory; the source file is never written.

use async_trait::async_trait;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{info, warn};
use uuid::Uuid;

/// Label used when the viewer could not be identified.
pub const FALLBACK_LABEL: &str = "fu";

const STDERR_TAIL_LINES: usize = 20;

/// Longest label prefix embedded in a render filename.
const MAX_NAME_LABEL_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start renderer: {0}")]
    Spawn(#[source] io::Error),
    #[error("renderer exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("render queue is full")]
    Busy,
    #[error("render did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Watermark label for an identified viewer, e.g. `u7`.
///
/// Characters outside `[A-Za-z0-9._@-]` become `_` so the label is safe both
/// as a header value and inside the drawtext filter.
pub fn label_for_subject(subject_id: &str) -> String {
    let cleaned: String = subject_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("u{}", cleaned)
}

/// One render: burn `label` into `source`, writing `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkJob {
    pub source: PathBuf,
    pub label: String,
    pub destination: PathBuf,
}

impl WatermarkJob {
    /// Build a job whose destination is unique per asset, label and request.
    pub fn new(
        source: impl Into<PathBuf>,
        label: impl Into<String>,
        temp_dir: &Path,
        asset_id: i64,
    ) -> Self {
        let label = label.into();
        let name_label: String = label
            .chars()
            .take(MAX_NAME_LABEL_CHARS)
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let destination = temp_dir.join(format!(
            "wm-{}-{}-{}.mp4",
            asset_id,
            name_label,
            Uuid::new_v4()
        ));
        Self {
            source: source.into(),
            label,
            destination,
        }
    }
}

/// Seam between the stream service and the encoder.
#[async_trait]
pub trait WatermarkRenderer: Send + Sync {
    async fn render(&self, job: &WatermarkJob) -> Result<(), RenderError>;

    /// Readiness probe; `Err` carries a human-readable reason.
    fn check_ready(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Look of the burned-in label.
#[derive(Debug, Clone)]
pub struct WatermarkStyle {
    pub font_size: u32,
    pub opacity: f32,
    /// Distance from the right and bottom edges, in pixels.
    pub margin: u32,
    pub font_file: Option<PathBuf>,
}

impl Default for WatermarkStyle {
    fn default() -> Self {
        Self {
            font_size: 30,
            opacity: 0.8,
            margin: 10,
            font_file: None,
        }
    }
}

/// Renders watermarks by shelling out to ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegRenderer {
    ffmpeg: PathBuf,
    style: WatermarkStyle,
    preset: String,
}

impl FfmpegRenderer {
    pub fn new(ffmpeg: impl Into<PathBuf>, style: WatermarkStyle) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            style,
            preset: "veryfast".to_string(),
        }
    }

    /// Full ffmpeg argument list for `job`.
    pub fn args(&self, job: &WatermarkJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(job.source.clone().into_os_string());
        args.push("-vf".into());
        args.push(drawtext_filter(&job.label, &self.style).into());
        for arg in ["-c:v", "libx264", "-preset"] {
            args.push(arg.into());
        }
        args.push(self.preset.clone().into());
        for arg in ["-c:a", "copy", "-movflags", "+faststart"] {
            args.push(arg.into());
        }
        args.push(job.destination.clone().into_os_string());
        args
    }
}

#[async_trait]
impl WatermarkRenderer for FfmpegRenderer {
    async fn render(&self, job: &WatermarkJob) -> Result<(), RenderError> {
        let started = Instant::now();
        info!(
            source = %job.source.display(),
            destination = %job.destination.display(),
            label = %job.label,
            "Rendering watermark"
        );

        let output = Command::new(&self.ffmpeg)
            .args(self.args(job))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(RenderError::Spawn)?;

        if !output.status.success() {
            if let Err(err) = fs::remove_file(&job.destination).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "could not remove partial render {}: {}",
                        job.destination.display(),
                        err
                    );
                }
            }
            return Err(RenderError::Failed {
                status: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        info!(
            label = %job.label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Watermark rendered"
        );
        Ok(())
    }

    fn check_ready(&self) -> Result<(), String> {
        which::which(&self.ffmpeg)
            .map(|_| ())
            .map_err(|err| format!("{} not usable: {}", self.ffmpeg.display(), err))
    }
}

/// The `drawtext` filter anchoring `label` to the bottom-right corner.
pub fn drawtext_filter(label: &str, style: &WatermarkStyle) -> String {
    let opacity = style.opacity.clamp(0.0, 1.0);
    let mut filter = format!(
        "drawtext=text='{}':expansion=none:fontcolor=white@{:.2}:fontsize={}:x=w-tw-{}:y=h-th-{}",
        escape_quoted(label),
        opacity,
        style.font_size,
        style.margin,
        style.margin
    );
    if let Some(font) = &style.font_file {
        filter.push_str(":fontfile=");
        filter.push_str(&escape_option(&font.to_string_lossy()));
    }
    filter
}

/// A single quote cannot appear inside a quoted filter value; close the
/// quote, emit an escaped one, and reopen.
fn escape_quoted(text: &str) -> String {
    text.replace('\'', r"'\''")
}

/// Escape characters special to the filter option parser.
fn escape_option(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '\'' | ':' | ',' | ';' | '[' | ']' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
