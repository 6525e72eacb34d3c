//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the film DB, the render temp
//!   directory and (when watermarking) the encoder

use crate::services::stream_service::StreamService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Performs a best-effort write/read/delete in the render temp directory.
/// 3. Checks the watermark renderer when watermarking is enabled.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(service): State<StreamService>) -> impl IntoResponse {
    let mut checks = HashMap::new();

    // 1) SQLite check
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.locator().db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("sqlite", sqlite_check);

    // 2) Temp directory write/read/delete check
    let temp_dir = &service.settings().temp_dir;
    let tmp_path = temp_dir.join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::create_dir_all(temp_dir).await {
        Err(e) => CheckStatus::failed(format!("could not create temp dir: {}", e)),
        Ok(()) => match fs::write(&tmp_path, b"readyz").await {
            Err(e) => CheckStatus::failed(format!("could not write tmp file: {}", e)),
            Ok(()) => {
                let read = fs::read(&tmp_path).await;
                let removed = fs::remove_file(&tmp_path).await;
                match (read, removed) {
                    (Ok(bytes), Ok(())) if bytes == b"readyz" => CheckStatus::ok(),
                    (Ok(bytes), Err(e)) if bytes == b"readyz" => CheckStatus {
                        ok: true,
                        error: Some(format!("could not remove tmp file: {}", e)),
                    },
                    (Ok(_), _) => CheckStatus::failed("file content mismatch".to_string()),
                    (Err(e), _) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
                }
            }
        },
    };
    checks.insert("temp_dir", disk_check);

    // 3) Renderer check
    if service.settings().watermark {
        let renderer_check = match service.renderer().check_ready() {
            Ok(()) => CheckStatus::ok(),
            Err(e) => CheckStatus::failed(e),
        };
        checks.insert("renderer", renderer_check);
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
