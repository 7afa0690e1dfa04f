//! WriteQueue - the single writer in front of the knowledge store
//!
//! Every job enqueues its store mutations here. One background task owns the
//! store handle, accumulates operations into batches, and commits each batch
//! in its own transaction. A batch is flushed when it reaches `batch_size`
//! or when `batch_timeout` has passed since the previous flush.
//!
//! A failed batch is rolled back and dropped. Each op in it is reported
//! through its callback; nothing is retried here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use knowledgestore::{KnowledgeStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{WriteError, WriteOp, WriteOperation};

/// Queue tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueConfig {
    /// Flush once this many ops are pending
    pub batch_size: usize,
    /// Flush once this long has passed since the last flush
    pub batch_timeout: Duration,
    /// Bounded channel capacity; producers wait beyond it
    pub max_queue_size: usize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_secs(1),
            max_queue_size: 10_000,
        }
    }
}

/// Queue counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteQueueStats {
    /// Ops accepted by enqueue
    pub queued: u64,
    /// Ops whose batch committed
    pub committed: u64,
    /// Ops lost to failed batches
    pub dropped: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Accepted but not yet resolved
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
}

enum QueueItem {
    Op(WriteOperation),
    Shutdown,
}

/// Handle to the write queue; clone freely
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<QueueItem>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WriteQueue {
    /// Spawn the writer task that owns `store`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(store: Box<dyn KnowledgeStore>, config: WriteQueueConfig) -> Self {
        debug!(?config, "WriteQueue::start: called");
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(writer_loop(store, rx, config.clone(), counters.clone()));
        info!(
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            "WriteQueue started"
        );

        Self {
            tx,
            counters,
            closed: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Enqueue an op, waiting only while the queue is full
    pub async fn enqueue(&self, op: impl Into<WriteOperation>) -> Result<(), WriteError> {
        let op = op.into();
        debug!(kind = op.op.kind(), "WriteQueue::enqueue: called");
        if self.closed.load(Ordering::SeqCst) {
            return reject(op, WriteError::QueueClosed);
        }
        match self.tx.send(QueueItem::Op(op)).await {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => reject_item(item, WriteError::QueueClosed),
        }
    }

    /// Enqueue without waiting; a full queue rejects the op
    pub fn try_enqueue(&self, op: impl Into<WriteOperation>) -> Result<(), WriteError> {
        let op = op.into();
        debug!(kind = op.op.kind(), "WriteQueue::try_enqueue: called");
        if self.closed.load(Ordering::SeqCst) {
            return reject(op, WriteError::QueueClosed);
        }
        match self.tx.try_send(QueueItem::Op(op)) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => reject_item(item, WriteError::Full),
            Err(mpsc::error::TrySendError::Closed(item)) => reject_item(item, WriteError::QueueClosed),
        }
    }

    /// Enqueue from a plain thread, blocking while the queue is full
    ///
    /// Panics if called from inside an async context, like any blocking send.
    pub fn enqueue_blocking(&self, op: impl Into<WriteOperation>) -> Result<(), WriteError> {
        let op = op.into();
        debug!(kind = op.op.kind(), "WriteQueue::enqueue_blocking: called");
        if self.closed.load(Ordering::SeqCst) {
            return reject(op, WriteError::QueueClosed);
        }
        match self.tx.blocking_send(QueueItem::Op(op)) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => reject_item(item, WriteError::QueueClosed),
        }
    }

    /// Enqueue and get a receiver that resolves once the op's batch settles
    pub async fn enqueue_with_ack(&self, op: WriteOp) -> oneshot::Receiver<Result<Value, WriteError>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let op = WriteOperation::with_callback(op, move |result| {
            let _ = ack_tx.send(result);
        });
        // Rejections are delivered through the callback too
        let _ = self.enqueue(op).await;
        ack_rx
    }

    pub fn stats(&self) -> WriteQueueStats {
        let queued = self.counters.queued.load(Ordering::Relaxed);
        let committed = self.counters.committed.load(Ordering::Relaxed);
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        WriteQueueStats {
            queued,
            committed,
            dropped,
            batches_committed: self.counters.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            pending: queued.saturating_sub(committed + dropped),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush what is pending and stop the writer
    ///
    /// Waits up to `timeout` for the writer to exit. If it does not, a
    /// warning is logged and this returns anyway.
    pub async fn stop(&self, timeout: Duration) -> WriteQueueStats {
        debug!(?timeout, "WriteQueue::stop: called");
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("WriteQueue::stop: already stopped");
            return self.stats();
        }
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();

        let deadline = Instant::now() + timeout;
        let stopped = async {
            let _ = self.tx.send(QueueItem::Shutdown).await;
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout_at(deadline, stopped).await.is_err() {
            warn!(?timeout, "WriteQueue writer did not stop in time");
        } else {
            info!("WriteQueue stopped");
        }
        self.stats()
    }
}

fn reject(op: WriteOperation, error: WriteError) -> Result<(), WriteError> {
    debug!(kind = op.op.kind(), %error, "WriteQueue: op rejected");
    op.complete(Err(error.clone()));
    Err(error)
}

fn reject_item(item: QueueItem, error: WriteError) -> Result<(), WriteError> {
    match item {
        QueueItem::Op(op) => reject(op, error),
        QueueItem::Shutdown => Err(error),
    }
}

async fn writer_loop(
    mut store: Box<dyn KnowledgeStore>,
    mut rx: mpsc::Receiver<QueueItem>,
    config: WriteQueueConfig,
    counters: Arc<Counters>,
) {
    debug!("writer_loop: called");
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<WriteOperation> = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now() + config.batch_timeout;

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(QueueItem::Op(op))) => {
                batch.push(op);
                if batch.len() >= batch_size {
                    debug!("writer_loop: batch full");
                    flush(store.as_mut(), &mut batch, &counters);
                    deadline = Instant::now() + config.batch_timeout;
                }
            }
            Ok(Some(QueueItem::Shutdown)) | Ok(None) => {
                debug!("writer_loop: shutting down");
                // Ops accepted before the close still get written
                rx.close();
                while let Some(item) = rx.recv().await {
                    if let QueueItem::Op(op) = item {
                        batch.push(op);
                        if batch.len() >= batch_size {
                            flush(store.as_mut(), &mut batch, &counters);
                        }
                    }
                }
                flush(store.as_mut(), &mut batch, &counters);
                break;
            }
            Err(_) => {
                if !batch.is_empty() {
                    debug!(pending = batch.len(), "writer_loop: batch timeout");
                    flush(store.as_mut(), &mut batch, &counters);
                }
                deadline = Instant::now() + config.batch_timeout;
            }
        }
    }
    debug!("writer_loop: exited");
}

fn flush(store: &mut dyn KnowledgeStore, batch: &mut Vec<WriteOperation>, counters: &Counters) {
    if batch.is_empty() {
        return;
    }
    let ops = std::mem::take(batch);
    let count = ops.len() as u64;
    debug!(%count, "flush: called");

    match run_batch(store, &ops) {
        Ok(results) => {
            counters.committed.fetch_add(count, Ordering::Relaxed);
            counters.batches_committed.fetch_add(1, Ordering::Relaxed);
            for (op, result) in ops.into_iter().zip(results) {
                op.complete(Ok(result));
            }
        }
        Err(e) => {
            warn!(error = %e, lock_conflict = e.is_lock_conflict(), %count, "Write batch failed, dropping");
            counters.dropped.fetch_add(count, Ordering::Relaxed);
            counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            let error = WriteError::BatchFailed(e.to_string());
            for op in ops {
                op.complete(Err(error.clone()));
            }
        }
    }
}

fn run_batch(store: &mut dyn KnowledgeStore, ops: &[WriteOperation]) -> Result<Vec<Value>, StoreError> {
    store.begin()?;
    let mut results = Vec::with_capacity(ops.len());
    for op in ops {
        match op.op.apply(store) {
            Ok(value) => results.push(value),
            Err(e) => {
                if let Err(rb) = store.rollback() {
                    warn!(error = %rb, "Rollback failed");
                }
                return Err(e);
            }
        }
    }
    if let Err(e) = store.commit() {
        if let Err(rb) = store.rollback() {
            debug!(error = %rb, "run_batch: rollback after failed commit");
        }
        return Err(e);
    }
    Ok(results)
}
