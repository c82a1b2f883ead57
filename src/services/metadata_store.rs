//! src/services/metadata_store.rs
//!
//! MetadataStore — durable upload records in SQLite. This is the single
//! source of truth for upload status. The unique index on `idempotency_key`
//! is the concurrency control for deduplication: concurrent intakes race to
//! insert and the loser gets a constraint violation, surfaced here as
//! `MetadataError::DuplicateKey`. Status transitions are guarded UPDATEs so
//! a record can never move backwards, regardless of worker interleaving.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::upload::{UploadRecord, UploadStatus};

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "id, idempotency_key, original_name, content_type, size_bytes, \
     storage_key, bucket, status, error_message, checksum, \
     created_at, updated_at, completed_at";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("an upload already exists for this idempotency key")]
    DuplicateKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Fields supplied by the orchestrator when creating a record. Everything
/// else (id, status, timestamps) is generated here.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub idempotency_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub storage_key: String,
    pub bucket: String,
    pub checksum: Option<String>,
}

#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema, statement by statement. Idempotent; used
    /// both at startup and by tests against in-memory databases.
    pub async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for stmt in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(pool).await?;
        }
        Ok(())
    }

    /// Insert a new PENDING record and return the persisted form.
    ///
    /// A unique-index violation on `idempotency_key` maps to `DuplicateKey`;
    /// the caller is expected to re-read the winning record rather than
    /// propagate the conflict.
    pub async fn insert_pending(&self, new: NewUpload) -> Result<UploadRecord, MetadataError> {
        let now = Utc::now();
        let result = sqlx::query_as::<_, UploadRecord>(&format!(
            "INSERT INTO uploads ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, NULL)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.idempotency_key)
        .bind(&new.original_name)
        .bind(&new.content_type)
        .bind(new.size_bytes)
        .bind(&new.storage_key)
        .bind(&new.bucket)
        .bind(UploadStatus::Pending)
        .bind(&new.checksum)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(record) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(MetadataError::DuplicateKey),
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<UploadRecord>, sqlx::Error> {
        sqlx::query_as::<_, UploadRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<UploadRecord>, sqlx::Error> {
        sqlx::query_as::<_, UploadRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM uploads WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&*self.db)
        .await
    }

    /// All records, newest created first.
    pub async fn list_all(&self) -> Result<Vec<UploadRecord>, sqlx::Error> {
        sqlx::query_as::<_, UploadRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM uploads ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&*self.db)
        .await
    }

    /// PENDING → UPLOADING. Returns false if the record was missing or not
    /// in PENDING (the guard closes the door on regressions).
    pub async fn mark_uploading(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE uploads
             SET status = ?, error_message = NULL, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Uploading)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadStatus::Pending)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// UPLOADING → COMPLETED. Sets `completed_at`, clears `error_message`.
    pub async fn mark_completed(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE uploads
             SET status = ?, error_message = NULL, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(UploadStatus::Uploading)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// PENDING or UPLOADING → FAILED with a human-readable cause. Terminal
    /// records are left untouched.
    pub async fn mark_failed(&self, id: Uuid, message: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE uploads
             SET status = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(UploadStatus::Failed)
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadStatus::Pending)
        .bind(UploadStatus::Uploading)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Return true if the SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
