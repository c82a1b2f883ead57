//! src/services/transfer.rs
//!
//! TransferWorker — the background half of the upload orchestrator. Runs on
//! the worker pool, never on the intake path. Errors here are absorbed into
//! the record's terminal state and surfaced only through polling; the caller
//! that initiated the upload is long gone.

use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::{
    metadata_store::MetadataStore,
    object_store::{ByteStream, ObjectStore},
    staging::StagedPayload,
};

/// One scheduled transfer: the record to drive plus the staged bytes to ship.
#[derive(Debug)]
pub struct TransferJob {
    pub record_id: Uuid,
    pub staged: StagedPayload,
}

#[derive(Clone)]
pub struct TransferWorker {
    metadata: MetadataStore,
    store: Arc<dyn ObjectStore>,
}

impl TransferWorker {
    pub fn new(metadata: MetadataStore, store: Arc<dyn ObjectStore>) -> Self {
        Self { metadata, store }
    }

    /// Drive one transfer to a terminal state. The staged payload is released
    /// on every path out of this function; `StagedPayload`'s drop backstop
    /// covers anything that escapes early.
    pub async fn execute_transfer(&self, mut job: TransferJob) {
        let record_id = job.record_id;
        self.run_transfer(record_id, &job.staged).await;
        job.staged.release().await;
    }

    async fn run_transfer(&self, record_id: Uuid, staged: &StagedPayload) {
        let record = match self.metadata.find_by_id(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Record deleted out of band; nothing to mark, nothing to
                // roll back.
                warn!(upload_id = %record_id, "upload record no longer exists, aborting transfer");
                return;
            }
            Err(err) => {
                error!(upload_id = %record_id, error = %err, "failed to load upload record");
                self.fail(record_id, &format!("failed to load upload record: {}", err))
                    .await;
                return;
            }
        };

        match self.metadata.mark_uploading(record_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(upload_id = %record_id, "record not in PENDING, skipping transfer");
                return;
            }
            Err(err) => {
                error!(upload_id = %record_id, error = %err, "failed to mark record UPLOADING");
                self.fail(record_id, &format!("failed to update status: {}", err))
                    .await;
                return;
            }
        }

        let reader = match staged.reader().await {
            Ok(reader) => reader,
            Err(err) => {
                self.fail(record_id, &format!("failed to read staged payload: {}", err))
                    .await;
                self.rollback(&record.bucket, &record.storage_key).await;
                return;
            }
        };
        let stream: ByteStream = Box::pin(ReaderStream::new(reader));

        let put_result = self
            .store
            .put(
                &record.bucket,
                &record.storage_key,
                stream,
                record.size_bytes,
                record.content_type.as_deref(),
            )
            .await;

        match put_result {
            Ok(()) => match self.metadata.mark_completed(record_id).await {
                Ok(true) => {
                    info!(
                        upload_id = %record_id,
                        storage_key = %record.storage_key,
                        size_bytes = record.size_bytes,
                        "transfer completed"
                    );
                }
                Ok(false) => {
                    warn!(upload_id = %record_id, "record left UPLOADING out of band, completion skipped");
                }
                Err(err) => {
                    error!(upload_id = %record_id, error = %err, "failed to mark record COMPLETED");
                }
            },
            Err(err) => {
                error!(upload_id = %record_id, error = %err, "transfer failed");
                self.fail(record_id, &format!("transfer failed: {}", err)).await;
                self.rollback(&record.bucket, &record.storage_key).await;
            }
        }
    }

    async fn fail(&self, record_id: Uuid, message: &str) {
        match self.metadata.mark_failed(record_id, message).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(upload_id = %record_id, "could not mark record FAILED (already terminal or missing)");
            }
            Err(err) => {
                error!(upload_id = %record_id, error = %err, "failed to persist FAILED status");
            }
        }
    }

    /// Best-effort compensating deletion of a partially written object.
    /// Single attempt, no retry; failures are logged and the record stays
    /// FAILED either way.
    async fn rollback(&self, bucket: &str, key: &str) {
        if !self.store.exists(bucket, key).await {
            return;
        }
        match self.store.delete(bucket, key).await {
            Ok(()) => info!(storage_key = %key, "rolled back partially written object"),
            Err(err) => {
                error!(storage_key = %key, error = %err, "rollback of partial object failed");
            }
        }
    }
}
