pub mod health_handlers;
pub mod stream_handlers;
