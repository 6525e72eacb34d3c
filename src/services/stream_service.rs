//! StreamService: the per-request streaming state machine.
//!
//! `ORIGIN_CHECK → LOCATE → TOKEN_CHECK → RENDER → TRANSFER → CLEANUP`, with
//! early exits to 403/404/401/500. The service knows nothing about axum: it
//! takes a plain [`StreamRequest`] and returns a [`StreamResponse`] whose body
//! is a byte stream. `handlers::stream_handlers` adapts both ends to HTTP.
//!
//! Any rendered temporary is owned by a [`TempArtifact`] that travels inside
//! the body stream, so it is removed when the stream finishes or is dropped
//! because the client went away.

use crate::{
    config::AppConfig,
    models::film::MediaAsset,
    services::{
        media_locator::MediaLocator,
        origin_guard::OriginGuard,
        render_pool::RenderPool,
        temp_artifact::TempArtifact,
        token_verifier::{TokenCheck, TokenPolicy, TokenVerifier},
        watermark::{
            FALLBACK_LABEL, FfmpegRenderer, RenderError, WatermarkJob, WatermarkRenderer,
            WatermarkStyle, label_for_subject,
        },
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, Take},
};
use tokio_util::io::ReaderStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("request origin is not trusted")]
    OriginRejected,
    #[error("film `{0}` not found")]
    AssetNotFound(String),
    #[error("video file for film `{0}` not found")]
    SourceFileMissing(i64),
    #[error("stream token missing")]
    TokenMissing,
    #[error("stream token invalid: {0}")]
    TokenInvalid(String),
    /// `len` is the representation length, when it is known.
    #[error("range not satisfiable for {len:?} bytes")]
    RangeNotSatisfiable { len: Option<u64> },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMethod {
    Get,
    /// Origin, lookup and token checks only; no render, no body.
    Head,
}

/// Framework-independent description of one stream request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: StreamMethod,
    /// Raw path segment; parsed only after the origin check.
    pub asset_id: String,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl StreamRequest {
    pub fn new(method: StreamMethod, asset_id: impl Into<String>) -> Self {
        Self {
            method,
            asset_id: asset_id.into(),
            headers: HashMap::new(),
            query: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Declared origin: `Referer`, falling back to `Origin`.
    pub fn origin(&self) -> Option<&str> {
        ["referer", "origin"]
            .into_iter()
            .filter_map(|name| self.header(name))
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    /// Bearer token from the `token` query parameter. Headers are not
    /// consulted: `<video>` elements cannot set them.
    pub fn token(&self) -> Option<&str> {
        self.query
            .get("token")
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }
}

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub(crate) fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// `Content-Range` of a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub range: ByteRange,
    pub total: u64,
}

/// Outcome of a successful request, ready to be turned into HTTP.
#[derive(Debug)]
pub struct StreamResponse {
    pub asset: MediaAsset,
    pub label: String,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    /// `None` for HEAD.
    pub body: Option<StreamBody>,
}

/// The bytes to send plus whatever must be released once they are sent.
#[derive(Debug)]
pub struct StreamBody {
    asset_id: i64,
    reader: Take<File>,
    chunk_size: usize,
    artifact: Option<TempArtifact>,
}

impl StreamBody {
    /// Chunked byte stream. Reads are pulled by the consumer one chunk at a
    /// time; the artifact is removed after the last chunk, or on drop.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let Self {
            asset_id,
            reader,
            chunk_size,
            artifact,
        } = self;

        let cleanup = stream::once(async move {
            if let Some(mut artifact) = artifact {
                if let Err(err) = artifact.cleanup().await {
                    warn!(
                        asset_id,
                        "failed to remove {} after transfer: {}",
                        artifact.path().display(),
                        err
                    );
                }
            }
            debug!(asset_id, "stream transfer finished");
        })
        .filter_map(|()| async { None::<io::Result<Bytes>> });

        ReaderStream::with_capacity(reader, chunk_size).chain(cleanup)
    }
}

/// Deployment-level switches for the stream path.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub token_policy: TokenPolicy,
    pub watermark: bool,
    pub chunk_size: usize,
    pub temp_dir: PathBuf,
}

#[derive(Clone)]
pub struct StreamService {
    guard: Arc<OriginGuard>,
    locator: MediaLocator,
    verifier: Arc<TokenVerifier>,
    renderer: Arc<dyn WatermarkRenderer>,
    pool: RenderPool,
    settings: Arc<StreamSettings>,
}

impl StreamService {
    pub fn new(
        guard: OriginGuard,
        locator: MediaLocator,
        verifier: TokenVerifier,
        renderer: Arc<dyn WatermarkRenderer>,
        pool: RenderPool,
        settings: StreamSettings,
    ) -> Self {
        Self {
            guard: Arc::new(guard),
            locator,
            verifier: Arc::new(verifier),
            renderer,
            pool,
            settings: Arc::new(settings),
        }
    }

    /// Wire the service from configuration with the ffmpeg renderer.
    pub fn from_config(cfg: &AppConfig, db: Arc<SqlitePool>) -> Self {
        let style = WatermarkStyle {
            font_file: cfg.watermark_font.clone(),
            ..WatermarkStyle::default()
        };
        let guard = OriginGuard::new(cfg.allowed_origins.clone());
        if guard.allowed().is_empty() {
            warn!("no trusted origins configured; every stream request will be rejected");
        }
        Self::new(
            guard,
            MediaLocator::new(db, cfg.media_root.clone()),
            TokenVerifier::new(&cfg.jwt_secret, cfg.jwt_algorithm, cfg.token_leeway_secs),
            Arc::new(FfmpegRenderer::new(cfg.ffmpeg_path.clone(), style)),
            RenderPool::new(cfg.render_workers, cfg.render_queue, cfg.render_timeout),
            StreamSettings {
                token_policy: cfg.token_policy,
                watermark: cfg.watermark,
                chunk_size: cfg.chunk_size,
                temp_dir: cfg.temp_dir.clone(),
            },
        )
    }

    pub fn locator(&self) -> &MediaLocator {
        &self.locator
    }

    pub fn renderer(&self) -> &dyn WatermarkRenderer {
        self.renderer.as_ref()
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Run one request through the state machine.
    pub async fn handle(&self, request: StreamRequest) -> StreamResult<StreamResponse> {
        let span = info_span!("stream", asset_id = %request.asset_id, method = ?request.method);
        self.process(request).instrument(span).await
    }

    async fn process(&self, request: StreamRequest) -> StreamResult<StreamResponse> {
        // ORIGIN_CHECK: nothing touches the disk before this passes.
        if !self.guard.allow(request.origin()) {
            warn!(
                origin = request.origin().unwrap_or("<none>"),
                "Forbidden: stream request from untrusted origin"
            );
            return Err(StreamError::OriginRejected);
        }

        // LOCATE
        let asset_id = parse_asset_id(&request.asset_id)?;
        let asset = self.locator.resolve(asset_id).await?;

        // TOKEN_CHECK
        let label = self.watermark_label(&request)?;

        if request.method == StreamMethod::Head {
            let content_length = (!self.settings.watermark).then_some(asset.size_bytes);
            return Ok(StreamResponse {
                asset,
                label,
                content_length,
                content_range: None,
                body: None,
            });
        }

        // The rendered length is unknown until the encode is done, but some
        // ranges cannot be satisfied by any length.
        if self.settings.watermark {
            if let Some(range) = request.header("range") {
                if range_never_satisfiable(range) {
                    debug!(range, "unsatisfiable range, skipping render");
                    return Err(StreamError::RangeNotSatisfiable { len: None });
                }
            }
        }

        // RENDER
        let (path, artifact) = if self.settings.watermark {
            let artifact = self.render(&asset, &label).await?;
            (artifact.path().to_path_buf(), Some(artifact))
        } else {
            (asset.path.clone(), None)
        };

        // TRANSFER (+ CLEANUP inside the body stream)
        self.transfer(asset, label, path, artifact, request.header("range"))
            .await
    }

    fn watermark_label(&self, request: &StreamRequest) -> StreamResult<String> {
        let policy = self.settings.token_policy;

        let Some(token) = request.token() else {
            if policy == TokenPolicy::Strict {
                warn!("stream request without token rejected");
                return Err(StreamError::TokenMissing);
            }
            info!("no stream token supplied, using fallback watermark label");
            return Ok(FALLBACK_LABEL.to_string());
        };

        match self.verifier.verify(token) {
            TokenCheck::Valid(verified) => {
                debug!(
                    subject = %verified.subject_id,
                    expires_at = %verified.expires_at,
                    "stream token verified"
                );
                Ok(label_for_subject(&verified.subject_id))
            }
            TokenCheck::Invalid(reason) => match policy {
                TokenPolicy::Strict => {
                    warn!("stream request with invalid token rejected");
                    Err(StreamError::TokenInvalid(reason))
                }
                TokenPolicy::Lenient => {
                    info!("invalid stream token, using fallback watermark label");
                    Ok(FALLBACK_LABEL.to_string())
                }
            },
        }
    }

    async fn render(&self, asset: &MediaAsset, label: &str) -> StreamResult<TempArtifact> {
        fs::create_dir_all(&self.settings.temp_dir).await?;
        let job = WatermarkJob::new(&asset.path, label, &self.settings.temp_dir, asset.id);
        let mut artifact = TempArtifact::new(&job.destination);

        let rendered = match self.pool.submit(self.renderer.as_ref(), &job).await {
            Ok(()) => ensure_output(&job.destination).await,
            Err(err) => Err(err),
        };

        match rendered {
            Ok(()) => Ok(artifact),
            Err(err) => {
                error!(error = %err, "watermark render failed");
                if let Err(cleanup_err) = artifact.cleanup().await {
                    warn!(
                        "failed to remove partial render {}: {}",
                        artifact.path().display(),
                        cleanup_err
                    );
                }
                Err(err.into())
            }
        }
    }

    async fn transfer(
        &self,
        asset: MediaAsset,
        label: String,
        path: PathBuf,
        artifact: Option<TempArtifact>,
        range_header: Option<&str>,
    ) -> StreamResult<StreamResponse> {
        let mut file = File::open(&path).await.map_err(|err| {
            if artifact.is_some() {
                error!(path = %path.display(), error = %err, "rendered video unreadable");
                StreamError::Render(RenderError::Io(err))
            } else if err.kind() == io::ErrorKind::NotFound {
                error!(path = %path.display(), "video file vanished before transfer");
                StreamError::SourceFileMissing(asset.id)
            } else {
                StreamError::Io(err)
            }
        })?;
        let total = file.metadata().await?.len();

        let range = match range_header {
            Some(value) => parse_range_header(value, total)?,
            None => None,
        };
        let (length, content_range) = match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                (range.len(), Some(ContentRange { range, total }))
            }
            None => (total, None),
        };

        info!(
            label = %label,
            bytes = length,
            partial = content_range.is_some(),
            watermarked = artifact.is_some(),
            "streaming film"
        );

        Ok(StreamResponse {
            body: Some(StreamBody {
                asset_id: asset.id,
                reader: file.take(length),
                chunk_size: self.settings.chunk_size,
                artifact,
            }),
            asset,
            label,
            content_length: Some(length),
            content_range,
        })
    }
}

/// Malformed ids are reported as unknown films.
fn parse_asset_id(raw: &str) -> StreamResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| StreamError::AssetNotFound(raw.to_string()))
}

/// A renderer that reports success must have left a regular file behind.
async fn ensure_output(path: &Path) -> Result<(), RenderError> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(RenderError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("render output {} is not a regular file", path.display()),
        ))),
        Err(err) => Err(RenderError::Io(err)),
    }
}

/// True for ranges that no representation length can satisfy, e.g. `bytes=-0`.
fn range_never_satisfiable(value: &str) -> bool {
    matches!(
        parse_range_header(value, u64::MAX),
        Err(StreamError::RangeNotSatisfiable { .. })
    )
}

/// Parse a single `Range: bytes=...` header against a file of `total` bytes.
///
/// Returns `Ok(None)` for headers that should be ignored (other units,
/// multiple ranges, malformed syntax) and `RangeNotSatisfiable` when the
/// range is well-formed but lies outside the file.
pub fn parse_range_header(value: &str, total: u64) -> StreamResult<Option<ByteRange>> {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if ranges.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());
    let unsatisfiable = StreamError::RangeNotSatisfiable { len: Some(total) };

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500 (last 500 bytes)
        (true, false) => {
            let Ok(suffix) = end.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || total == 0 {
                return Err(unsatisfiable);
            }
            Ok(Some(ByteRange {
                start: total.saturating_sub(suffix),
                end: total - 1,
            }))
        }
        // bytes=500- (from 500 to end)
        (false, true) => {
            let Ok(start) = start.parse::<u64>() else {
                return Ok(None);
            };
            if start >= total {
                return Err(unsatisfiable);
            }
            Ok(Some(ByteRange {
                start,
                end: total - 1,
            }))
        }
        // bytes=0-499
        (false, false) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return Ok(None);
            };
            if end < start {
                return Ok(None);
            }
            if start >= total {
                return Err(unsatisfiable);
            }
            Ok(Some(ByteRange {
                start,
                end: end.min(total - 1),
            }))
        }
        (true, true) => Ok(None),
    }
}
