//! In-memory transaction storage
//!
//! Records are keyed by transaction id, so a batch re-queued after a failed
//! write can be saved again without creating duplicates.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core::TransactionStorage;
use crate::types::{AccountId, StorageError, Transaction, TransactionId, TransactionStats};

/// Thread-safe in-memory history store
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: DashMap<TransactionId, Transaction>,
    logins: DashMap<AccountId, DateTime<Utc>>,

    /// Remaining injected write failures
    failing_writes: AtomicU32,

    batch_calls: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` writes (single or batch) fail
    pub fn fail_next_writes(&self, times: u32) {
        self.failing_writes.store(times, Ordering::SeqCst);
    }

    /// Number of `save_batch` calls received, failed ones included
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.records.contains_key(&id)
    }

    /// Every stored record, oldest first
    pub fn all(&self) -> Vec<Transaction> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|t| (t.timestamp, t.id));
        records
    }

    fn take_write_fault(&self) -> Result<(), StorageError> {
        let tripped = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StorageError::backend("injected write fault"))
        } else {
            Ok(())
        }
    }

    fn newest_first<F>(&self, limit: usize, keep: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }
}

#[async_trait]
impl TransactionStorage for InMemoryStorage {
    async fn save_one(&self, transaction: &Transaction) -> Result<(), StorageError> {
        self.take_write_fault()?;
        self.records.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn save_batch(&self, transactions: &[Transaction]) -> Result<(), StorageError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.take_write_fault()?;
        for transaction in transactions {
            self.records.insert(transaction.id, transaction.clone());
        }
        Ok(())
    }

    async fn history(
        &self,
        account: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        Ok(self.newest_first(limit, |t| t.involves(account)))
    }

    async fn history_since(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        Ok(self.newest_first(limit, |t| t.involves(account) && t.timestamp >= since))
    }

    async fn stats(&self, account: AccountId) -> Result<TransactionStats, StorageError> {
        let mut stats = TransactionStats::default();
        for record in self.records.iter() {
            let t = record.value();
            if t.sender == Some(account) {
                stats.sent_count += 1;
                stats.sent_total = stats.sent_total.saturating_add(t.amount);
            }
            if t.receiver == account {
                stats.received_count += 1;
                stats.received_total = stats.received_total.saturating_add(t.amount);
            }
        }
        Ok(stats)
    }

    async fn last_login(&self, account: AccountId) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.logins.get(&account).map(|at| *at))
    }

    async fn record_last_login(
        &self,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.logins.insert(account, at);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let before = self.records.len();
        self.records.retain(|_, t| t.timestamp >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }
}
