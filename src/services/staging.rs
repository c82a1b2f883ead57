//! src/services/staging.rs
//!
//! StagingArea — transient local holding for payload bytes between the
//! synchronous intake path and the background transfer. Every upload gets a
//! private uuid-named directory; release removes the file and the directory
//! together. `StagedPayload` also cleans itself up on drop, so the staged
//! bytes cannot outlive the transfer no matter which error path runs.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to stage payload: {0}")]
    Io(#[from] io::Error),
}

/// Handle to one staged payload. Owned by the intake path until the transfer
/// job takes it; the transfer worker reads through it and releases it.
#[derive(Debug)]
pub struct StagedPayload {
    dir: PathBuf,
    path: PathBuf,
    released: bool,
}

impl StagedPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the staged file for a read pass.
    pub async fn reader(&self) -> io::Result<File> {
        File::open(&self.path).await
    }

    /// MD5 over the staged bytes, read in 8 KiB chunks.
    pub async fn checksum(&self) -> io::Result<String> {
        let mut file = self.reader().await?;
        let mut digest = md5::Context::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
        }
        Ok(format!("{:x}", digest.compute()))
    }

    /// Remove the staged file and its directory. Safe to call on a handle
    /// that was already released or never fully staged.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for result in [
            fs::remove_file(&self.path).await,
            fs::remove_dir(&self.dir).await,
        ] {
            if let Err(err) = result {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to clean staged payload {}: {}", self.dir.display(), err);
                }
            }
        }
        debug!("released staged payload {}", self.dir.display());
    }
}

impl Drop for StagedPayload {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Backstop for paths that never reached release().
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

#[derive(Clone, Debug)]
pub struct StagingArea {
    base_path: PathBuf,
}

impl StagingArea {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Copy the payload into a private holding location, counting bytes.
    /// Partial writes are cleaned up before the error is returned.
    pub async fn stage<S>(&self, stream: S) -> Result<(StagedPayload, i64), StagingError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let dir = self.base_path.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).await?;
        let path = dir.join("payload");

        let mut staged = StagedPayload {
            dir,
            path,
            released: false,
        };

        let mut file = File::create(&staged.path).await?;
        let mut size_bytes: i64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    staged.release().await;
                    return Err(StagingError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            if let Err(err) = file.write_all(&chunk).await {
                staged.release().await;
                return Err(StagingError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            staged.release().await;
            return Err(StagingError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            staged.release().await;
            return Err(StagingError::Io(err));
        }

        debug!(
            "staged {} bytes at {}",
            size_bytes,
            staged.path.display()
        );
        Ok((staged, size_bytes))
    }
}
