//! Defines routes for the streaming service.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz` - liveness
//!   - `GET  /readyz` - readiness (database, temp dir, renderer)
//!
//! - **Streaming**
//!   - `GET|HEAD /stream/{asset_id}?token=...` - stream a film
//!   - `GET|HEAD /api/films/{asset_id}/stream[/]?token=...` - same handler,
//!     the path the front-end player links to

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        stream_handlers::stream_video,
    },
    services::stream_service::StreamService,
};
use axum::{Router, routing::get};

/// Build and return the router for all routes.
///
/// The router carries shared state (`StreamService`) to all handlers.
pub fn routes() -> Router<StreamService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stream/{asset_id}", get(stream_video).head(stream_video))
        .route(
            "/api/films/{asset_id}/stream",
            get(stream_video).head(stream_video),
        )
        .route(
            "/api/films/{asset_id}/stream/",
            get(stream_video).head(stream_video),
        )
}
