//! src/services/transfer_queue.rs
//!
//! Bounded scheduler for background transfers. A single dispatcher task
//! pulls jobs off a bounded channel and spawns them against a semaphore, so
//! at most `max_workers` transfers run at once and at most `queue_capacity`
//! wait. Submission blocks for a bounded wait when the queue is full and
//! then fails loudly; jobs are never dropped silently. Shutdown drains the
//! backlog before acknowledging.

use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::services::transfer::{TransferJob, TransferWorker};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transfer queue is saturated, retry later")]
    Saturated(TransferJob),
    #[error("transfer queue is shut down")]
    Closed(TransferJob),
}

#[derive(Clone, Debug)]
pub struct TransferQueueConfig {
    /// Maximum number of concurrent transfers (semaphore permits).
    pub max_workers: usize,
    /// Maximum number of queued, not-yet-running transfers.
    pub queue_capacity: usize,
    /// How long a submitter may block on a full queue before rejection.
    pub submit_wait: Duration,
}

impl Default for TransferQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            queue_capacity: 100,
            submit_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct TransferQueue {
    tx: mpsc::Sender<TransferJob>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    submit_wait: Duration,
}

impl TransferQueue {
    pub fn new(worker: TransferWorker, config: TransferQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let submit_wait = config.submit_wait;
        let max_workers = config.max_workers.max(1);

        tokio::spawn(Self::dispatch_loop(rx, shutdown_rx, worker, max_workers));

        info!(
            max_workers = max_workers,
            queue_capacity = config.queue_capacity,
            "transfer queue started"
        );

        Self {
            tx,
            shutdown_tx,
            submit_wait,
        }
    }

    /// Submit a transfer, waiting up to the configured bound if the queue is
    /// full. Returns the job back inside the error so the caller can clean
    /// up the staged payload and mark the record.
    pub async fn submit(&self, job: TransferJob) -> Result<(), QueueError> {
        match self.tx.send_timeout(job, self.submit_wait).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(job)) => {
                warn!(upload_id = %job.record_id, "transfer queue full, rejecting submission");
                Err(QueueError::Saturated(job))
            }
            Err(mpsc::error::SendTimeoutError::Closed(job)) => {
                error!(upload_id = %job.record_id, "transfer queue closed, rejecting submission");
                Err(QueueError::Closed(job))
            }
        }
    }

    /// Drain the backlog and wait for in-flight transfers to finish.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.shutdown_tx.send(done_tx).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    async fn dispatch_loop(
        mut rx: mpsc::Receiver<TransferJob>,
        mut shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
        worker: TransferWorker,
        max_workers: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

        let drain = loop {
            tokio::select! {
                ack = shutdown_rx.recv() => {
                    // Either an explicit shutdown or every queue handle is
                    // gone; stop accepting and drain the backlog.
                    shutdown_ack = ack;
                    break true;
                }
                job = rx.recv() => {
                    match job {
                        Some(job) => Self::dispatch_one(&semaphore, &worker, job).await,
                        None => break false,
                    }
                }
            }
        };

        if drain {
            rx.close();
            while let Some(job) = rx.recv().await {
                Self::dispatch_one(&semaphore, &worker, job).await;
            }
        }

        // Queue exhausted: wait for every in-flight transfer.
        let _ = semaphore.acquire_many(max_workers as u32).await;
        info!("transfer queue drained and stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Block until a worker slot frees up, then run the transfer on it.
    async fn dispatch_one(semaphore: &Arc<Semaphore>, worker: &TransferWorker, job: TransferJob) {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let worker = worker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.execute_transfer(job).await;
        });
    }
}
