//! Core transfer pipeline
//!
//! This module contains the components a transfer passes through once every
//! caller-side gate has admitted it:
//! - `traits` - Ledger and history storage collaborators
//! - `account_locks` - Per-account serialization of concurrent transfers
//! - `balance_cache` - Short-lived cache of sender balances
//! - `batch_processor` - Queued, batched history persistence
//! - `engine` - Transfer execution, tax, rollback and the worker pool

pub mod account_locks;
pub mod balance_cache;
pub mod batch_processor;
pub mod engine;
pub mod traits;

pub use account_locks::AccountLocks;
pub use balance_cache::{BalanceCache, CachedBalance};
pub use batch_processor::PersistenceQueue;
pub use engine::{InFlightStage, InFlightTransfer, TransactionManager, TransactionManagerBuilder};
pub use traits::{Ledger, TransactionStorage};
