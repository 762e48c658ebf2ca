//! Collaborator traits for the ledger and the history store
//!
//! The engine never owns balances or history itself. It talks to a
//! [`Ledger`] for money and a [`TransactionStorage`] for records, both behind
//! `Arc<dyn _>` so backends can be swapped (in-memory for tests and replay,
//! remote services in production).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{
    AccountId, LedgerError, StorageError, Transaction, TransactionStats,
};

/// Balance authority
///
/// Each call is atomic on its own; no call is atomic with any other.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether the ledger knows `currency`
    async fn currency_exists(&self, currency: &str) -> Result<bool, LedgerError>;

    /// Current balance of `account` in `currency`
    async fn balance(&self, account: AccountId, currency: &str) -> Result<Decimal, LedgerError>;

    /// Credit `delta` to `account`
    async fn add_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError>;

    /// Debit `delta` from `account`
    async fn remove_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError>;

    /// Human-readable currency name, falling back to the code
    async fn currency_display_name(&self, currency: &str) -> String {
        currency.to_string()
    }
}

/// Durable transaction history
///
/// Transaction ids are unique keys: saving a record twice must not create a
/// duplicate, so the engine can retry failed batches blindly.
#[async_trait]
pub trait TransactionStorage: Send + Sync {
    async fn save_one(&self, transaction: &Transaction) -> Result<(), StorageError>;

    /// Save every record or none of them
    async fn save_batch(&self, transactions: &[Transaction]) -> Result<(), StorageError>;

    /// Newest-first history where `account` is sender or receiver
    async fn history(
        &self,
        account: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError>;

    /// Newest-first history at or after `since`
    async fn history_since(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError>;

    async fn stats(&self, account: AccountId) -> Result<TransactionStats, StorageError>;

    async fn last_login(&self, account: AccountId) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn record_last_login(
        &self,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Delete records older than `cutoff`, returning how many were removed
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}
