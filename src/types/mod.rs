//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `transaction`: Transaction records, pending confirmations, identifiers
//! - `error`: Error types for amounts, collaborators, and transfers

pub mod error;
pub mod transaction;

pub use error::{AmountError, LedgerError, StorageError, TransactionErrorKind, TransferError};
pub use transaction::{
    AccountId, CurrencyCode, PendingTransaction, Privileges, Transaction, TransactionId,
    TransactionResult, TransactionStats, SYSTEM_SENDER,
};
