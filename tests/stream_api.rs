//! Stream API integration tests
//!
//! Drives the real router with an in-memory film database, a temp media
//! root and stand-in renderers.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use film_stream::{
    db,
    routes::routes::routes,
    services::{
        media_locator::MediaLocator,
        origin_guard::OriginGuard,
        render_pool::RenderPool,
        stream_service::{StreamService, StreamSettings},
        token_verifier::{TokenPolicy, TokenVerifier},
        watermark::{RenderError, WatermarkJob, WatermarkRenderer},
    },
};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, get_current_timestamp};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tower::ServiceExt;

const SECRET: &str = "integration-secret";
const TRUSTED: &str = "http://localhost:3000";
const SOURCE: &[u8] = b"file_content";

/// Copies the source and appends `|<label>`, standing in for ffmpeg.
#[derive(Default)]
struct CopyRenderer {
    jobs: Mutex<Vec<WatermarkJob>>,
}

#[async_trait]
impl WatermarkRenderer for CopyRenderer {
    async fn render(&self, job: &WatermarkJob) -> Result<(), RenderError> {
        let mut bytes = tokio::fs::read(&job.source).await?;
        bytes.extend_from_slice(format!("|{}", job.label).as_bytes());
        tokio::fs::write(&job.destination, bytes).await?;
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}

/// Leaves a partial output behind and fails.
struct BrokenRenderer;

#[async_trait]
impl WatermarkRenderer for BrokenRenderer {
    async fn render(&self, job: &WatermarkJob) -> Result<(), RenderError> {
        tokio::fs::write(&job.destination, b"partial").await?;
        Err(RenderError::Failed {
            status: Some(1),
            stderr: "Invalid data found when processing input".into(),
        })
    }
}

/// Reports success without writing anything.
struct SilentRenderer;

#[async_trait]
impl WatermarkRenderer for SilentRenderer {
    async fn render(&self, _job: &WatermarkJob) -> Result<(), RenderError> {
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    temp_dir: PathBuf,
    media_root: PathBuf,
    locator: MediaLocator,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let media_root = dir.path().join("media");
        let temp_dir = dir.path().join("tmp");
        std::fs::create_dir_all(media_root.join("films/videos")).unwrap();
        std::fs::write(media_root.join("films/videos/test.mp4"), SOURCE).unwrap();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO films (id, title, description, release_date, duration, video_path)
             VALUES (42, 'Test Film', 'Test Description', '2023-01-01', 120, 'films/videos/test.mp4')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let locator = MediaLocator::new(Arc::new(pool), &media_root);
        Self {
            _dir: dir,
            temp_dir,
            media_root,
            locator,
        }
    }

    fn app(
        &self,
        policy: TokenPolicy,
        watermark: bool,
        renderer: Arc<dyn WatermarkRenderer>,
    ) -> Router {
        let service = StreamService::new(
            OriginGuard::new([TRUSTED]),
            self.locator.clone(),
            TokenVerifier::new(SECRET, Algorithm::HS256, 0),
            renderer,
            RenderPool::new(2, 2, Duration::from_secs(5)),
            StreamSettings {
                token_policy: policy,
                watermark,
                chunk_size: 4,
                temp_dir: self.temp_dir.clone(),
            },
        );
        routes().with_state(service)
    }

    fn plain_app(&self) -> Router {
        self.app(TokenPolicy::Lenient, false, Arc::new(CopyRenderer::default()))
    }

    fn temp_files(&self) -> usize {
        match std::fs::read_dir(&self.temp_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

fn token_for(user_id: i64) -> String {
    sign(json!({
        "user_id": user_id,
        "exp": get_current_timestamp() + 3600,
        "token_type": "access",
    }))
}

fn sign(claims: serde_json::Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn get(uri: &str, referer: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::REFERER, referer)
        .body(Body::empty())
        .unwrap()
}

/// Serve `app` on a loopback socket and send one raw HEAD request, returning
/// the response head as hyper wrote it (lowercased).
async fn raw_head(app: Router, uri: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nReferer: {}\r\nConnection: close\r\n\r\n",
        uri, addr, TRUSTED
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    server.abort();

    String::from_utf8(raw).unwrap().to_ascii_lowercase()
}

async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(body: Body) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(body).await).unwrap()
}

fn watermark(response: &axum::response::Response) -> &str {
    response.headers()["x-watermark-text"].to_str().unwrap()
}

#[tokio::test]
async fn valid_token_streams_source_with_subject_label() {
    let h = Harness::new().await;
    let uri = format!("/stream/42?token={}", token_for(7));

    let response = h.plain_app().oneshot(get(&uri, TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "inline; filename=\"Test Film.mp4\""
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
    assert_eq!(watermark(&response), "u7");
    assert_eq!(body_bytes(response.into_body()).await, SOURCE);
}

#[tokio::test]
async fn head_returns_same_label_without_body() {
    let h = Harness::new().await;
    let uri = format!("/stream/42?token={}", token_for(7));
    let request = Request::head(&uri)
        .header(header::REFERER, TRUSTED)
        .body(Body::empty())
        .unwrap();

    let response = h.plain_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
    assert_eq!(watermark(&response), "u7");
    assert!(body_bytes(response.into_body()).await.is_empty());
}

#[tokio::test]
async fn untrusted_origin_is_forbidden_without_touching_disk() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());
    let uri = format!("/stream/42?token={}", token_for(7));

    let response = app
        .oneshot(get(&uri, "http://malicious.example"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "access denied");
    assert_eq!(json["status"], 403);
    assert!(renderer.jobs.lock().unwrap().is_empty());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn missing_referer_is_forbidden() {
    let h = Harness::new().await;
    let request = Request::get("/stream/42").body(Body::empty()).unwrap();

    let response = h.plain_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn origin_header_is_accepted_when_referer_is_absent() {
    let h = Harness::new().await;
    let request = Request::get("/stream/42")
        .header(header::ORIGIN, TRUSTED)
        .body(Body::empty())
        .unwrap();

    let response = h.plain_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_source_file_is_not_found() {
    let h = Harness::new().await;
    std::fs::remove_file(h.media_root.join("films/videos/test.mp4")).unwrap();
    let uri = format!("/stream/42?token={}", token_for(7));

    let response = h.plain_app().oneshot(get(&uri, TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "video file not found");
}

#[tokio::test]
async fn unknown_asset_is_not_found_before_token_check() {
    let h = Harness::new().await;
    let app = h.app(TokenPolicy::Strict, false, Arc::new(CopyRenderer::default()));

    let response = app.oneshot(get("/stream/999", TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "film not found");
}

#[tokio::test]
async fn lenient_policy_falls_back_for_bad_or_missing_tokens() {
    let h = Harness::new().await;
    let expired = sign(json!({"user_id": 7, "exp": get_current_timestamp() - 3600}));
    let uris = [
        "/stream/42".to_string(),
        "/stream/42?token=".to_string(),
        "/stream/42?token=not.a.jwt".to_string(),
        format!("/stream/42?token={}", expired),
    ];

    for uri in uris {
        let response = h.plain_app().oneshot(get(&uri, TRUSTED)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(watermark(&response), "fu", "{uri}");
        assert_eq!(body_bytes(response.into_body()).await, SOURCE);
    }
}

#[tokio::test]
async fn strict_policy_rejects_bad_or_missing_tokens() {
    let h = Harness::new().await;
    let app = h.app(TokenPolicy::Strict, false, Arc::new(CopyRenderer::default()));

    let missing = app
        .clone()
        .oneshot(get("/stream/42", TRUSTED))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let invalid = app
        .clone()
        .oneshot(get("/stream/42?token=garbage", TRUSTED))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);

    let uri = format!("/stream/42?token={}", token_for(7));
    let valid = app.oneshot(get(&uri, TRUSTED)).await.unwrap();
    assert_eq!(valid.status(), StatusCode::OK);
    assert_eq!(watermark(&valid), "u7");
}

#[tokio::test]
async fn watermarked_transfer_streams_render_and_removes_it() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());
    let uri = format!("/stream/42?token={}", token_for(7));

    let response = app.oneshot(get(&uri, TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(watermark(&response), "u7");
    let job = renderer.jobs.lock().unwrap()[0].clone();
    assert_eq!(job.label, "u7");
    assert!(job.destination.starts_with(&h.temp_dir));
    assert!(job.destination.exists());

    assert_eq!(body_bytes(response.into_body()).await, b"file_content|u7");
    assert!(!job.destination.exists());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn aborted_watermarked_transfer_still_removes_render() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());

    let response = app.oneshot(get("/stream/42", TRUSTED)).await.unwrap();
    assert_eq!(watermark(&response), "fu");
    let destination = renderer.jobs.lock().unwrap()[0].destination.clone();
    assert!(destination.exists());

    // Client goes away before reading a single byte.
    drop(response);

    assert!(!destination.exists());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn concurrent_viewers_get_distinct_renders() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());

    let first = app
        .clone()
        .oneshot(get(&format!("/stream/42?token={}", token_for(7)), TRUSTED))
        .await
        .unwrap();
    let second = app
        .oneshot(get(&format!("/stream/42?token={}", token_for(8)), TRUSTED))
        .await
        .unwrap();

    let jobs = renderer.jobs.lock().unwrap().clone();
    assert_eq!(jobs.len(), 2);
    assert_ne!(jobs[0].destination, jobs[1].destination);

    assert_eq!(body_bytes(first.into_body()).await, b"file_content|u7");
    assert_eq!(body_bytes(second.into_body()).await, b"file_content|u8");
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn render_failure_is_server_error_and_leaves_nothing_behind() {
    let h = Harness::new().await;
    let app = h.app(TokenPolicy::Lenient, true, Arc::new(BrokenRenderer));

    let response = app.oneshot(get("/stream/42", TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response.into_body()).await;
    assert!(json["error"].is_string());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn head_with_watermarking_does_not_render() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());
    let request = Request::head(format!("/stream/42?token={}", token_for(7)))
        .header(header::REFERER, TRUSTED)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(watermark(&response), "u7");
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    assert!(renderer.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn range_request_returns_partial_content() {
    let h = Harness::new().await;
    let request = Request::get("/stream/42")
        .header(header::REFERER, TRUSTED)
        .header(header::RANGE, "bytes=0-3")
        .body(Body::empty())
        .unwrap();

    let response = h.plain_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-3/12");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
    assert_eq!(body_bytes(response.into_body()).await, b"file");
}

#[tokio::test]
async fn range_past_end_is_not_satisfiable() {
    let h = Harness::new().await;
    let request = Request::get("/stream/42")
        .header(header::REFERER, TRUSTED)
        .header(header::RANGE, "bytes=100-")
        .body(Body::empty())
        .unwrap();

    let response = h.plain_app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */12");
}

#[tokio::test]
async fn front_end_path_is_served_by_same_handler() {
    let h = Harness::new().await;
    let uri = format!("/api/films/42/stream/?token={}", token_for(7));

    let response = h.plain_app().oneshot(get(&uri, TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(watermark(&response), "u7");
}

#[tokio::test]
async fn probes_report_ok() {
    let h = Harness::new().await;

    let health = h
        .plain_app()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let ready = h
        .plain_app()
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let json = body_json(ready.into_body()).await;
    assert_eq!(json["checks"]["sqlite"]["ok"], true);
    assert_eq!(json["checks"]["temp_dir"]["ok"], true);
    assert!(h.temp_dir.exists());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn watermarked_head_on_the_wire_has_no_content_length() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());
    let uri = format!("/stream/42?token={}", token_for(7));

    let head = raw_head(app, &uri).await;

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains("x-watermark-text: u7"), "{head}");
    assert!(!head.contains("content-length"), "{head}");
    assert!(renderer.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn plain_head_on_the_wire_reports_source_length() {
    let h = Harness::new().await;

    let head = raw_head(h.plain_app(), "/stream/42").await;

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains("content-length: 12"), "{head}");
    assert!(head.contains("x-watermark-text: fu"), "{head}");
}

#[tokio::test]
async fn non_numeric_id_is_checked_against_origin_first() {
    let h = Harness::new().await;

    let foreign = h
        .plain_app()
        .oneshot(get("/stream/abc", "http://malicious.example"))
        .await
        .unwrap();
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);
    let json = body_json(foreign.into_body()).await;
    assert_eq!(json["error"], "access denied");

    let trusted = h
        .plain_app()
        .oneshot(get("/stream/abc", TRUSTED))
        .await
        .unwrap();
    assert_eq!(trusted.status(), StatusCode::NOT_FOUND);
    let json = body_json(trusted.into_body()).await;
    assert_eq!(json["error"], "film not found");
    assert_eq!(json["status"], 404);
}

#[tokio::test]
async fn render_without_output_is_server_error() {
    let h = Harness::new().await;
    let app = h.app(TokenPolicy::Lenient, true, Arc::new(SilentRenderer));

    let response = app.oneshot(get("/stream/42", TRUSTED)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "failed to prepare video");
    assert!(h.media_root.join("films/videos/test.mp4").exists());
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
async fn empty_suffix_range_is_rejected_before_rendering() {
    let h = Harness::new().await;
    let renderer = Arc::new(CopyRenderer::default());
    let app = h.app(TokenPolicy::Lenient, true, renderer.clone());
    let request = Request::get("/stream/42")
        .header(header::REFERER, TRUSTED)
        .header(header::RANGE, "bytes=-0")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    assert!(renderer.jobs.lock().unwrap().is_empty());
    assert_eq!(h.temp_files(), 0);
}
