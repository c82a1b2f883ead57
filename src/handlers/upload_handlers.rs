//! HTTP handlers for the upload intake and status endpoints.
//! Streams the multipart payload straight into the staging area without
//! buffering it in memory and delegates orchestration to `UploadService`.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::TryStreamExt;
use std::io;
use uuid::Uuid;

use crate::{AppState, errors::AppError, models::view::UploadView};

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// `POST /uploads` — accept a multipart payload for asynchronous transfer.
///
/// Requires a non-blank `X-Idempotency-Key` header and a `file` part.
/// Returns 202 whether the upload was newly accepted or is a duplicate of a
/// prior request; the view's `message` says which.
pub async fn initiate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("X-Idempotency-Key header is required"))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let stream = field.map_err(io::Error::other);

        let view = state
            .uploads
            .initiate_upload(stream, &original_name, content_type, &idempotency_key)
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(view)));
    }

    Err(AppError::bad_request("multipart body must contain a `file` part"))
}

/// `GET /uploads/{id}` — current status and metadata for one upload.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadView>, AppError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::not_found(format!("upload `{}` not found", id)))?;

    state
        .uploads
        .get_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("upload `{}` not found", id)))
}

/// `GET /uploads/by-key/{idempotency_key}` — lookup by idempotency token.
pub async fn get_upload_by_key(
    State(state): State<AppState>,
    Path(idempotency_key): Path<String>,
) -> Result<Json<UploadView>, AppError> {
    state
        .uploads
        .get_by_idempotency_key(&idempotency_key)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::not_found(format!(
                "no upload recorded for idempotency key `{}`",
                idempotency_key
            ))
        })
}

/// `GET /uploads` — all uploads, newest created first.
pub async fn list_uploads(
    State(state): State<AppState>,
) -> Result<Json<Vec<UploadView>>, AppError> {
    Ok(Json(state.uploads.list_all().await?))
}
