//! Data models for the film streaming service.
//!
//! Film rows are owned by the catalogue backend; this service only reads
//! them via `sqlx::FromRow` and never writes.

pub mod film;
