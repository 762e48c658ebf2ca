//! Batched persistence of completed transactions
//!
//! The engine appends every successful transaction to an unbounded FIFO
//! queue. A flusher task wakes on a fixed interval, drains at most
//! `batch_size` records and writes them with a single
//! [`TransactionStorage::save_batch`] call.
//!
//! # Failure handling
//!
//! A failed batch is pushed back to the *front* of the queue in its original
//! order, so the next attempt retries the same records before anything newer.
//! Storage treats ids as unique keys, so a retry never duplicates history.
//!
//! # Architecture
//!
//! ```text
//! PersistenceQueue
//!     ├── Mutex<VecDeque<Transaction>>   (pending records)
//!     ├── tokio Mutex<()>                (one flush at a time)
//!     └── Arc<dyn TransactionStorage>    (destination)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::TransactionStorage;
use crate::metrics::Metrics;
use crate::settings::SettingsHandle;
use crate::types::{StorageError, Transaction};

/// FIFO queue of transactions awaiting persistence
pub struct PersistenceQueue {
    storage: Arc<dyn TransactionStorage>,
    settings: SettingsHandle,
    metrics: Metrics,
    pending: Mutex<VecDeque<Transaction>>,

    /// Held for the duration of a drain-and-write so re-queued batches land
    /// in front of records drained by nobody else
    flushing: tokio::sync::Mutex<()>,

    span: tracing::Span,
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl PersistenceQueue {
    pub fn new(
        storage: Arc<dyn TransactionStorage>,
        settings: SettingsHandle,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            settings,
            metrics,
            pending: Mutex::new(VecDeque::new()),
            flushing: tokio::sync::Mutex::new(()),
            span: tracing::Span::none(),
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Append a record to the back of the queue
    pub fn enqueue(&self, transaction: Transaction) {
        self.pending.lock().push_back(transaction);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn drain(&self, max: usize) -> Vec<Transaction> {
        let mut pending = self.pending.lock();
        let take = max.min(pending.len());
        pending.drain(..take).collect()
    }

    fn requeue_front(&self, batch: Vec<Transaction>) {
        let mut pending = self.pending.lock();
        for transaction in batch.into_iter().rev() {
            pending.push_front(transaction);
        }
    }

    async fn write(&self, batch: Vec<Transaction>) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let size = batch.len();
        match self.storage.save_batch(&batch).await {
            Ok(()) => {
                self.metrics.record_batch(size);
                tracing::debug!(parent: &self.span, size, "Persisted transaction batch");
                Ok(size)
            }
            Err(e) => {
                self.metrics.record_storage_failure();
                tracing::warn!(
                    parent: &self.span,
                    size,
                    error = %e,
                    "Failed to persist transaction batch, re-queued"
                );
                self.requeue_front(batch);
                Err(e)
            }
        }
    }

    /// Write at most `batch_size` of the oldest records
    ///
    /// # Returns
    ///
    /// Number of records persisted (zero when the queue was empty).
    ///
    /// # Errors
    ///
    /// The storage error of a failed write. The drained records are back at
    /// the front of the queue.
    pub async fn flush_once(&self) -> Result<usize, StorageError> {
        let _flushing = self.flushing.lock().await;
        let batch_size = self.settings.current().persistence.batch_size;
        let batch = self.drain(batch_size);
        self.write(batch).await
    }

    /// Drain everything and write it as one final batch
    pub async fn flush_all(&self) -> Result<usize, StorageError> {
        let _flushing = self.flushing.lock().await;
        let batch = self.drain(usize::MAX);
        self.write(batch).await
    }

    /// Call [`Self::flush_once`] every `flush_interval` until `token` fires
    ///
    /// The task does not flush on cancellation; callers perform the final
    /// flush themselves with [`Self::flush_all`] once producers have stopped.
    pub fn spawn_flusher(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let period = queue.settings.current().persistence.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // failures are logged and retried on the next tick
                        let _ = queue.flush_once().await;
                    }
                }
            }
            tracing::debug!(parent: &queue.span, "Persistence flusher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::settings::Settings;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use uuid::Uuid;

    fn queue_with(batch_size: usize) -> (Arc<PersistenceQueue>, Arc<InMemoryStorage>, Metrics) {
        let storage = Arc::new(InMemoryStorage::new());
        let mut settings = Settings::default();
        settings.persistence.batch_size = batch_size;
        settings.persistence.flush_interval_ms = 1_000;
        let metrics = Metrics::new().unwrap();
        let queue = PersistenceQueue::new(
            Arc::clone(&storage) as Arc<dyn TransactionStorage>,
            SettingsHandle::new(settings),
            metrics.clone(),
        );
        (Arc::new(queue), storage, metrics)
    }

    fn record() -> Transaction {
        Transaction::new(None, Uuid::new_v4(), "tokens", Decimal::ONE)
    }

    #[tokio::test]
    async fn test_flush_once_respects_batch_size() {
        let (queue, storage, metrics) = queue_with(100);
        for _ in 0..250 {
            queue.enqueue(record());
        }

        assert_eq!(queue.flush_once().await.unwrap(), 100);
        assert_eq!(queue.flush_once().await.unwrap(), 100);
        assert_eq!(queue.flush_once().await.unwrap(), 50);
        assert_eq!(queue.flush_once().await.unwrap(), 0);

        assert_eq!(storage.len(), 250);
        assert_eq!(storage.batch_calls(), 3);
        assert_eq!(metrics.snapshot().batched_records, 250);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retained_in_order() {
        let (queue, storage, metrics) = queue_with(2);
        let records: Vec<_> = (0..3).map(|_| record()).collect();
        for r in &records {
            queue.enqueue(r.clone());
        }
        storage.fail_next_writes(1);

        assert!(queue.flush_once().await.is_err());
        assert_eq!(queue.len(), 3);
        assert_eq!(metrics.snapshot().storage_failures, 1);

        queue.flush_once().await.unwrap();
        assert!(storage.contains(records[0].id));
        assert!(storage.contains(records[1].id));
        assert!(!storage.contains(records[2].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_drains_in_ceil_n_over_batch_ticks() {
        let (queue, storage, _) = queue_with(10);
        for _ in 0..25 {
            queue.enqueue(record());
        }
        let token = CancellationToken::new();
        let flusher = queue.spawn_flusher(token.clone());

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert!(queue.is_empty());
        assert_eq!(storage.len(), 25);
        assert_eq!(storage.batch_calls(), 3);

        token.cancel();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_all_writes_one_batch() {
        let (queue, storage, _) = queue_with(10);
        for _ in 0..25 {
            queue.enqueue(record());
        }

        assert_eq!(queue.flush_all().await.unwrap(), 25);
        assert_eq!(storage.batch_calls(), 1);
        assert!(queue.is_empty());
    }
}
