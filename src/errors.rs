use crate::services::{stream_service::StreamError, watermark::RenderError};
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub headers: HeaderMap,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, self.headers, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Client-facing messages stay short; internal detail goes to the log.
impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::OriginRejected => AppError::forbidden("access denied"),
            StreamError::AssetNotFound(_) => AppError::not_found("film not found"),
            StreamError::SourceFileMissing(_) => AppError::not_found("video file not found"),
            StreamError::TokenMissing => AppError::unauthorized("authorization token required"),
            StreamError::TokenInvalid(_) => AppError::unauthorized("invalid token"),
            StreamError::RangeNotSatisfiable { len } => {
                let mut error =
                    AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable");
                if let Some(len) = len {
                    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", len)) {
                        error.headers.insert(header::CONTENT_RANGE, value);
                    }
                }
                error
            }
            StreamError::Render(RenderError::Busy) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "watermark renderer busy, retry later",
            ),
            StreamError::Render(err) => {
                tracing::error!(error = %err, "render failure surfaced to client");
                AppError::internal("failed to prepare video")
            }
            StreamError::Database(err) => {
                tracing::error!(error = %err, "film lookup failed");
                AppError::internal("failed to stream video")
            }
            StreamError::Io(err) => {
                tracing::error!(error = %err, "stream i/o failure");
                AppError::internal("failed to stream video")
            }
        }
    }
}
