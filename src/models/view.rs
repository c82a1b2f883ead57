//! Caller-facing projection of an upload record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::upload::{UploadRecord, UploadStatus};

/// What API callers see when they submit an upload or poll for its status.
///
/// Field names are camelCase on the wire. `message` distinguishes a freshly
/// accepted upload from the replayed view of a duplicate request; it is unset
/// on plain status reads.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadView {
    pub id: Uuid,
    pub idempotency_key: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UploadView {
    pub fn from_record(record: &UploadRecord, message: Option<String>) -> Self {
        Self {
            id: record.id,
            idempotency_key: record.idempotency_key.clone(),
            original_name: record.original_name.clone(),
            size_bytes: record.size_bytes,
            content_type: record.content_type.clone(),
            status: record.status,
            error_message: record.error_message.clone(),
            checksum: record.checksum.clone(),
            created_at: record.created_at,
            completed_at: record.completed_at,
            message,
        }
    }
}
