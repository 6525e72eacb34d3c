//! Streaming pipeline components, leaves first.

pub mod media_locator;
pub mod origin_guard;
pub mod render_pool;
pub mod stream_service;
pub mod temp_artifact;
pub mod token_verifier;
pub mod watermark;
