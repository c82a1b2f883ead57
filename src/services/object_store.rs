//! src/services/object_store.rs
//!
//! Capability interface for the object store plus the disk-backed
//! implementation used as the real backend. Payloads live beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`; writes go through a temporary
//! file, are fsynced, and are renamed into place so a crashed transfer never
//! leaves a half-visible object at the final path.
//!
//! All operations are synchronous from the caller's point of view; the
//! asynchrony of background transfers lives in the scheduler, not here.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Byte stream fed to `put`. Boxed so the trait stays object safe.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object store rejected the request: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The capability the transfer worker needs from an object store.
///
/// `exists` never fails for "not found"; absence is simply `false`.
/// `ensure_bucket` is idempotent create-if-absent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        size_bytes: i64,
        content_type: Option<&str>,
    ) -> Result<(), TransferError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), TransferError>;

    async fn exists(&self, bucket: &str, key: &str) -> bool;

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), TransferError>;
}

/// Disk-backed object store.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    base_path: PathBuf,
}

impl FsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers derived from MD5(bucket/key), keeping the
    /// file count per directory bounded.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Remove empty shard directories between `start` and the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        size_bytes: i64,
        _content_type: Option<&str>,
    ) -> Result<(), TransferError> {
        let file_path = self.object_path(bucket, key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| TransferError::Backend("object path has no parent".into()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut written: i64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(TransferError::Io(err));
                }
            };
            written += chunk.len() as i64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransferError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::Io(err));
        }

        if written != size_bytes {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::Backend(format!(
                "declared {} bytes but received {}",
                size_bytes, written
            )));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::Io(err));
        }

        debug!(
            "stored object {}/{} ({} bytes) at {}",
            bucket,
            key,
            written,
            file_path.display()
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), TransferError> {
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TransferError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(TransferError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> bool {
        fs::try_exists(self.object_path(bucket, key))
            .await
            .unwrap_or(false)
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), TransferError> {
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::tempdir;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<io::Result<Bytes>>>(),
        ))
    }

    #[tokio::test]
    async fn put_exists_delete_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.ensure_bucket("uploads").await.unwrap();

        assert!(!store.exists("uploads", "a.bin").await);
        store
            .put("uploads", "a.bin", byte_stream(vec![b"hello ", b"world"]), 11, None)
            .await
            .unwrap();
        assert!(store.exists("uploads", "a.bin").await);

        store.delete("uploads", "a.bin").await.unwrap();
        assert!(!store.exists("uploads", "a.bin").await);
    }

    #[tokio::test]
    async fn delete_absent_object_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.ensure_bucket("uploads").await.unwrap();

        let err = store.delete("uploads", "missing.bin").await.unwrap_err();
        assert!(matches!(err, TransferError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn put_rejects_size_mismatch_and_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.ensure_bucket("uploads").await.unwrap();

        let err = store
            .put("uploads", "truncated.bin", byte_stream(vec![b"abc"]), 9, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Backend(_)));
        assert!(!store.exists("uploads", "truncated.bin").await);
    }

    #[tokio::test]
    async fn delete_prunes_empty_shard_directories() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.ensure_bucket("uploads").await.unwrap();

        store
            .put("uploads", "one.bin", byte_stream(vec![b"x"]), 1, None)
            .await
            .unwrap();
        store.delete("uploads", "one.bin").await.unwrap();

        // Bucket root survives, shard directories are gone.
        let bucket_root = dir.path().join("uploads");
        assert!(bucket_root.exists());
        let mut entries = tokio::fs::read_dir(&bucket_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
