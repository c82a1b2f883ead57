//! Represents one accepted upload attempt and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an upload record.
///
/// Status only moves forward: `Pending` → `Uploading` → `Completed` or
/// `Failed`. The guarded UPDATE statements in `MetadataStore` are the
/// authority for that ordering; nothing resets a terminal record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    /// Record persisted, transfer not yet started.
    Pending,
    /// A background worker has picked up the transfer.
    Uploading,
    /// Bytes landed in the object store.
    Completed,
    /// Transfer failed; see `error_message`.
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
        }
    }
}

/// Durable metadata for a single upload, keyed by a generated id with a
/// unique secondary key on the caller-supplied idempotency token.
///
/// Only `status`, `error_message`, `updated_at` and `completed_at` ever
/// change after creation, and only through `MetadataStore`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadRecord {
    /// Internal UUID, generated at creation, never reused.
    pub id: Uuid,

    /// Caller-supplied deduplication token, unique across all records.
    pub idempotency_key: String,

    /// Original filename as submitted by the caller.
    pub original_name: String,

    /// Content type (MIME type), if the caller supplied one.
    pub content_type: Option<String>,

    /// Payload size in bytes, measured at intake.
    pub size_bytes: i64,

    /// Generated name under which the bytes live in the object store.
    pub storage_key: String,

    /// Target bucket name.
    pub bucket: String,

    /// Current lifecycle status.
    pub status: UploadStatus,

    /// Human-readable cause, set on transition to FAILED.
    pub error_message: Option<String>,

    /// MD5 hash computed at intake; None if the computation failed.
    pub checksum: Option<String>,

    /// Set once when the record is created.
    pub created_at: DateTime<Utc>,

    /// Refreshed on every mutation.
    pub updated_at: DateTime<Utc>,

    /// Set only on transition into COMPLETED.
    pub completed_at: Option<DateTime<Utc>>,
}
