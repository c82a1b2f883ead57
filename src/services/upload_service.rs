//! src/services/upload_service.rs
//!
//! UploadService — the intake half of the upload orchestrator. Validates the
//! request, resolves idempotency against the metadata store, stages the
//! payload, persists the PENDING record, and hands the transfer to the
//! bounded queue. The intake path may touch local disk but never the object
//! store; remote I/O is isolated to the transfer workers.

use bytes::Bytes;
use futures::Stream;
use std::io;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::view::UploadView;
use crate::services::{
    metadata_store::{MetadataError, MetadataStore, NewUpload},
    staging::{StagingArea, StagingError},
    transfer::TransferJob,
    transfer_queue::{QueueError, TransferQueue},
};

const ACCEPTED_MESSAGE: &str =
    "Upload accepted for transfer. Poll GET /uploads/{id} for status.";
const DUPLICATE_MESSAGE: &str =
    "Duplicate request: an upload already exists for this idempotency key.";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("transfer queue is saturated, retry later")]
    QueueFull,
    #[error("transfer queue is unavailable, retry later")]
    QueueUnavailable,
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct UploadService {
    metadata: MetadataStore,
    staging: StagingArea,
    queue: TransferQueue,
    bucket: String,
}

impl UploadService {
    pub fn new(
        metadata: MetadataStore,
        staging: StagingArea,
        queue: TransferQueue,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            staging,
            queue,
            bucket: bucket.into(),
        }
    }

    /// Accept a payload for asynchronous transfer.
    ///
    /// Persist-then-schedule is the idempotency anchor: once the PENDING row
    /// exists, any concurrent request with the same key either sees it on
    /// lookup or loses the insert race on the unique index and re-reads.
    pub async fn initiate_upload<S>(
        &self,
        payload: S,
        original_name: &str,
        content_type: Option<String>,
        idempotency_key: &str,
    ) -> Result<UploadView, UploadError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if idempotency_key.trim().is_empty() {
            return Err(UploadError::InvalidInput(
                "idempotency key must not be blank".into(),
            ));
        }

        if let Some(existing) = self.metadata.find_by_idempotency_key(idempotency_key).await? {
            info!(
                upload_id = %existing.id,
                idempotency_key = %idempotency_key,
                status = existing.status.as_str(),
                "duplicate request, returning existing record"
            );
            return Ok(UploadView::from_record(
                &existing,
                Some(DUPLICATE_MESSAGE.into()),
            ));
        }

        let (mut staged, size_bytes) = self.staging.stage(payload).await?;
        if size_bytes == 0 {
            staged.release().await;
            return Err(UploadError::InvalidInput("payload must not be empty".into()));
        }

        // Checksum failure degrades to None; it never blocks the upload.
        let checksum = match staged.checksum().await {
            Ok(checksum) => Some(checksum),
            Err(err) => {
                warn!(error = %err, "checksum computation failed, proceeding without one");
                None
            }
        };

        let storage_key = generate_storage_key(original_name);
        let insert = self
            .metadata
            .insert_pending(NewUpload {
                idempotency_key: idempotency_key.to_string(),
                original_name: original_name.to_string(),
                content_type,
                size_bytes,
                storage_key,
                bucket: self.bucket.clone(),
                checksum,
            })
            .await;

        let record = match insert {
            Ok(record) => record,
            Err(MetadataError::DuplicateKey) => {
                // Lost the insert race; the winner's record is authoritative.
                staged.release().await;
                let existing = self
                    .metadata
                    .find_by_idempotency_key(idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        UploadError::Database(sqlx::Error::RowNotFound)
                    })?;
                info!(
                    upload_id = %existing.id,
                    idempotency_key = %idempotency_key,
                    "concurrent duplicate resolved to existing record"
                );
                return Ok(UploadView::from_record(
                    &existing,
                    Some(DUPLICATE_MESSAGE.into()),
                ));
            }
            Err(MetadataError::Sqlx(err)) => {
                staged.release().await;
                return Err(UploadError::Database(err));
            }
        };

        info!(
            upload_id = %record.id,
            idempotency_key = %idempotency_key,
            size_bytes = size_bytes,
            "upload record created, scheduling transfer"
        );

        let job = TransferJob {
            record_id: record.id,
            staged,
        };
        if let Err(err) = self.queue.submit(job).await {
            let (mut job, cause, failure) = match err {
                QueueError::Saturated(job) => {
                    (job, "transfer queue saturated", UploadError::QueueFull)
                }
                QueueError::Closed(job) => {
                    (job, "transfer queue unavailable", UploadError::QueueUnavailable)
                }
            };
            // A PENDING row no worker will ever pick up is worse than a
            // burned key; fail it visibly and tell the caller to retry.
            if let Err(db_err) = self.metadata.mark_failed(record.id, cause).await {
                warn!(upload_id = %record.id, error = %db_err, "failed to mark rejected upload FAILED");
            }
            job.staged.release().await;
            return Err(failure);
        }

        Ok(UploadView::from_record(&record, Some(ACCEPTED_MESSAGE.into())))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<UploadView>, UploadError> {
        Ok(self
            .metadata
            .find_by_id(id)
            .await?
            .map(|record| UploadView::from_record(&record, None)))
    }

    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<UploadView>, UploadError> {
        Ok(self
            .metadata
            .find_by_idempotency_key(key)
            .await?
            .map(|record| UploadView::from_record(&record, None)))
    }

    pub async fn list_all(&self) -> Result<Vec<UploadView>, UploadError> {
        Ok(self
            .metadata
            .list_all()
            .await?
            .iter()
            .map(|record| UploadView::from_record(record, None))
            .collect())
    }
}

/// Random unique storage name, keeping the original extension when present.
fn generate_storage_key(original_name: &str) -> String {
    let token = Uuid::new_v4();
    match original_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{}.{}", token, ext)
        }
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload::UploadStatus;
    use crate::services::object_store::{
        ByteStream, FsObjectStore, ObjectStore, TransferError,
    };
    use crate::services::transfer::TransferWorker;
    use crate::services::transfer_queue::TransferQueueConfig;
    use async_trait::async_trait;
    use futures::stream;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        service: UploadService,
        metadata: MetadataStore,
        store: Arc<dyn ObjectStore>,
        queue: TransferQueue,
        _staging_dir: TempDir,
        _storage_dir: Option<TempDir>,
    }

    async fn harness_with(
        store: Arc<dyn ObjectStore>,
        storage_dir: Option<TempDir>,
        queue_config: TransferQueueConfig,
    ) -> Harness {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MetadataStore::apply_schema(&pool).await.unwrap();
        let metadata = MetadataStore::new(Arc::new(pool));

        let staging_dir = tempdir().unwrap();
        let staging = StagingArea::new(staging_dir.path());

        store.ensure_bucket("uploads").await.unwrap();
        let worker = TransferWorker::new(metadata.clone(), store.clone());
        let queue = TransferQueue::new(worker, queue_config);

        let service = UploadService::new(metadata.clone(), staging, queue.clone(), "uploads");
        Harness {
            service,
            metadata,
            store,
            queue,
            _staging_dir: staging_dir,
            _storage_dir: storage_dir,
        }
    }

    async fn harness_with_store(
        store: Arc<dyn ObjectStore>,
        storage_dir: Option<TempDir>,
    ) -> Harness {
        harness_with(store, storage_dir, TransferQueueConfig::default()).await
    }

    async fn harness() -> Harness {
        let storage_dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(storage_dir.path()));
        harness_with_store(store, Some(storage_dir)).await
    }

    fn payload(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from_static(bytes))])
    }

    async fn await_terminal(harness: &Harness, id: Uuid) -> UploadStatus {
        for _ in 0..200 {
            let record = harness.metadata.find_by_id(id).await.unwrap().unwrap();
            if matches!(record.status, UploadStatus::Completed | UploadStatus::Failed) {
                return record.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer never reached a terminal state");
    }

    /// Staging cleanup runs after the terminal status is persisted, so give
    /// the worker a moment to finish it.
    async fn staging_is_empty(harness: &Harness) -> bool {
        for _ in 0..200 {
            let mut entries = tokio::fs::read_dir(harness._staging_dir.path()).await.unwrap();
            if entries.next_entry().await.unwrap().is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Object store double whose puts always fail without writing anything.
    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put(
            &self,
            _bucket: &str,
            _key: &str,
            _stream: ByteStream,
            _size_bytes: i64,
            _content_type: Option<&str>,
        ) -> Result<(), TransferError> {
            Err(TransferError::Backend("backend unreachable".into()))
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<(), TransferError> {
            Err(TransferError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }

        async fn exists(&self, _bucket: &str, _key: &str) -> bool {
            false
        }

        async fn ensure_bucket(&self, _bucket: &str) -> Result<(), TransferError> {
            Ok(())
        }
    }

    /// Double whose puts never return, pinning a worker so the queue backs up.
    struct HangingStore;

    #[async_trait]
    impl ObjectStore for HangingStore {
        async fn put(
            &self,
            _bucket: &str,
            _key: &str,
            _stream: ByteStream,
            _size_bytes: i64,
            _content_type: Option<&str>,
        ) -> Result<(), TransferError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn delete(&self, _bucket: &str, _key: &str) -> Result<(), TransferError> {
            Ok(())
        }

        async fn exists(&self, _bucket: &str, _key: &str) -> bool {
            false
        }

        async fn ensure_bucket(&self, _bucket: &str) -> Result<(), TransferError> {
            Ok(())
        }
    }

    /// Double that lands the full object and then reports failure, modeling a
    /// partial write the rollback has to clean up.
    struct PartialWriteStore {
        inner: FsObjectStore,
    }

    #[async_trait]
    impl ObjectStore for PartialWriteStore {
        async fn put(
            &self,
            bucket: &str,
            key: &str,
            stream: ByteStream,
            size_bytes: i64,
            content_type: Option<&str>,
        ) -> Result<(), TransferError> {
            self.inner
                .put(bucket, key, stream, size_bytes, content_type)
                .await?;
            Err(TransferError::Backend("connection reset after write".into()))
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<(), TransferError> {
            self.inner.delete(bucket, key).await
        }

        async fn exists(&self, bucket: &str, key: &str) -> bool {
            self.inner.exists(bucket, key).await
        }

        async fn ensure_bucket(&self, bucket: &str) -> Result<(), TransferError> {
            self.inner.ensure_bucket(bucket).await
        }
    }

    #[tokio::test]
    async fn accepted_upload_reaches_completed_with_checksum() {
        let harness = harness().await;
        let bytes: &'static [u8] = &[7u8; 1024];

        let view = harness
            .service
            .initiate_upload(payload(bytes), "report.pdf", Some("application/pdf".into()), "k1")
            .await
            .unwrap();
        assert_eq!(view.status, UploadStatus::Pending);
        assert_eq!(view.size_bytes, 1024);
        assert_eq!(
            view.checksum.as_deref(),
            Some(format!("{:x}", md5::compute(bytes)).as_str())
        );

        assert_eq!(await_terminal(&harness, view.id).await, UploadStatus::Completed);

        let record = harness.metadata.find_by_id(view.id).await.unwrap().unwrap();
        assert!(record.completed_at.is_some());
        assert!(record.error_message.is_none());
        assert!(record.storage_key.ends_with(".pdf"));
        assert!(harness.store.exists("uploads", &record.storage_key).await);
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn sequential_duplicate_returns_same_record_without_new_transfer() {
        let harness = harness().await;

        let first = harness
            .service
            .initiate_upload(payload(b"once"), "a.txt", None, "k1")
            .await
            .unwrap();
        await_terminal(&harness, first.id).await;

        let second = harness
            .service
            .initiate_upload(payload(b"twice"), "a.txt", None, "k1")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.message.as_deref().unwrap().contains("Duplicate"));

        let all = harness.service.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn concurrent_duplicates_observe_one_record() {
        let harness = harness().await;

        let (a, b) = tokio::join!(
            harness
                .service
                .initiate_upload(payload(b"payload-a"), "a.bin", None, "k1"),
            harness
                .service
                .initiate_upload(payload(b"payload-b"), "a.bin", None, "k1"),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(harness.service.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_before_any_record_exists() {
        let harness = harness().await;

        let err = harness
            .service
            .initiate_upload(stream::iter(Vec::<io::Result<Bytes>>::new()), "empty.txt", None, "k1")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));
        assert!(harness.service.list_all().await.unwrap().is_empty());
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn blank_idempotency_key_is_rejected() {
        let harness = harness().await;
        let err = harness
            .service
            .initiate_upload(payload(b"data"), "a.txt", None, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failing_backend_marks_record_failed_and_releases_staging() {
        let harness = harness_with_store(Arc::new(FailingStore), None).await;

        let view = harness
            .service
            .initiate_upload(payload(b"doomed"), "a.txt", None, "k1")
            .await
            .unwrap();
        assert_eq!(await_terminal(&harness, view.id).await, UploadStatus::Failed);

        let record = harness.metadata.find_by_id(view.id).await.unwrap().unwrap();
        assert!(record.error_message.as_deref().unwrap().contains("transfer failed"));
        assert!(record.completed_at.is_none());
        assert!(!harness.store.exists("uploads", &record.storage_key).await);
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn rollback_removes_a_partially_written_object() {
        let storage_dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(PartialWriteStore {
            inner: FsObjectStore::new(storage_dir.path()),
        });
        let harness = harness_with_store(store, Some(storage_dir)).await;

        let view = harness
            .service
            .initiate_upload(payload(b"half written"), "a.txt", None, "k1")
            .await
            .unwrap();
        assert_eq!(await_terminal(&harness, view.id).await, UploadStatus::Failed);

        let record = harness.metadata.find_by_id(view.id).await.unwrap().unwrap();
        assert!(record.error_message.is_some());
        assert!(!harness.store.exists("uploads", &record.storage_key).await);
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn terminal_records_are_not_reset_by_later_duplicates() {
        let harness = harness_with_store(Arc::new(FailingStore), None).await;

        let first = harness
            .service
            .initiate_upload(payload(b"doomed"), "a.txt", None, "k1")
            .await
            .unwrap();
        assert_eq!(await_terminal(&harness, first.id).await, UploadStatus::Failed);

        // A retry with the same key returns the stale FAILED record and does
        // not schedule another transfer.
        let retry = harness
            .service
            .initiate_upload(payload(b"retry"), "a.txt", None, "k1")
            .await
            .unwrap();
        assert_eq!(retry.id, first.id);
        assert_eq!(retry.status, UploadStatus::Failed);
        assert_eq!(harness.service.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn saturated_queue_rejects_upload_and_fails_the_record() {
        let harness = harness_with(
            Arc::new(HangingStore),
            None,
            TransferQueueConfig {
                max_workers: 1,
                queue_capacity: 1,
                submit_wait: Duration::from_millis(200),
            },
        )
        .await;

        // One transfer pinned on the worker, one held by the dispatcher, one
        // filling the channel. The fourth has nowhere to go.
        for key in ["k1", "k2", "k3"] {
            harness
                .service
                .initiate_upload(payload(b"stuck"), "a.txt", None, key)
                .await
                .unwrap();
        }
        let err = harness
            .service
            .initiate_upload(payload(b"stuck"), "a.txt", None, "k4")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::QueueFull));

        let record = harness
            .metadata
            .find_by_idempotency_key("k4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("transfer queue saturated"));

        // The rejected payload is released before the error returns; the three
        // accepted transfers still hold theirs.
        let mut entries = tokio::fs::read_dir(harness._staging_dir.path()).await.unwrap();
        let mut staged = 0;
        while entries.next_entry().await.unwrap().is_some() {
            staged += 1;
        }
        assert_eq!(staged, 3);
    }

    #[tokio::test]
    async fn stopped_queue_rejects_upload_and_fails_the_record() {
        let harness = harness().await;
        harness.queue.shutdown().await;

        let err = harness
            .service
            .initiate_upload(payload(b"too late"), "a.txt", None, "k1")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::QueueUnavailable));

        let record = harness
            .metadata
            .find_by_idempotency_key("k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("transfer queue unavailable"));
        assert!(staging_is_empty(&harness).await);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_transfers() {
        let harness = harness().await;

        let view = harness
            .service
            .initiate_upload(payload(b"drain me"), "a.txt", None, "k1")
            .await
            .unwrap();
        harness.queue.shutdown().await;

        let record = harness.metadata.find_by_id(view.id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
    }

    #[test]
    fn storage_keys_keep_the_extension() {
        assert!(generate_storage_key("report.pdf").ends_with(".pdf"));
        assert!(generate_storage_key("archive.tar.gz").ends_with(".gz"));
        let bare = generate_storage_key("README");
        assert!(!bare.contains('.'));
        // A leading dot is a hidden file, not an extension.
        let hidden = generate_storage_key(".env");
        assert!(!hidden.ends_with(".env"));
    }
}
