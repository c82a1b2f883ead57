//! Defines routes for the asynchronous upload API.
//!
//! ## Structure
//! - **Intake**
//!   - `POST /uploads` — accept a multipart payload (202, processed off-path)
//!
//! - **Status**
//!   - `GET /uploads` — list all uploads, newest first
//!   - `GET /uploads/{id}` — one upload by record id
//!   - `GET /uploads/by-key/{idempotency_key}` — one upload by idempotency token
//!
//! Health endpoints (`/healthz`, `/readyz`) are mounted at the root.

use crate::{
    AppState,
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{get_upload, get_upload_by_key, initiate_upload, list_uploads},
    },
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for the upload API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload endpoints
        .route("/uploads", post(initiate_upload).get(list_uploads))
        .route("/uploads/by-key/{idempotency_key}", get(get_upload_by_key))
        .route("/uploads/{id}", get(get_upload))
}
