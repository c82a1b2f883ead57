//! Core data models for the asynchronous upload service.
//!
//! `upload` holds the durable metadata record and its status machine; `view`
//! is the projection returned to API callers. Records map to the database via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod upload;
pub mod view;
