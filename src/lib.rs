//! Rust Transfer Engine Library
//!
//! # Overview
//!
//! Moves balances of named currencies between accounts on top of a ledger
//! that only offers single-call atomicity. Transfers are taxed, executed as
//! a debit followed by a credit with one compensating rollback on failure,
//! and persisted through a batched queue.
//!
//! # Architecture
//!
//! - [`types`] - Transactions, identifiers and error types
//! - [`settings`] - Layered configuration and the shared settings handle
//! - [`amount`] - Parsing (`10k`, `2.5M`), bounds and display of amounts
//! - [`currency`] - Currency admission (exists, blocked, allow-list)
//! - [`core`] - Execution pipeline:
//!   - [`core::engine`] - Tax, debit/credit, rollback, worker pool, shutdown
//!   - [`core::balance_cache`] - Short-lived balance cache
//!   - [`core::batch_processor`] - Batched persistence queue and flusher
//!   - [`core::account_locks`] - Per-account serialization
//!   - [`core::traits`] - Ledger and storage collaborators
//! - [`gates`] - Cooldown, rate limit and confirmation gates
//! - [`service`] - Caller-side gate sequence, pay-all, history and sessions
//! - [`memory`] - In-memory ledger and storage
//! - [`notify`], [`metrics`], [`logging`] - Notices, counters, log setup
//! - [`io`], [`replay`], [`cli`] - CSV replay runner
//! - [`loadtest`] - Stress, ramp and benchmark runs

pub mod amount;
pub mod cli;
pub mod core;
pub mod currency;
pub mod gates;
pub mod io;
pub mod loadtest;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod notify;
pub mod replay;
pub mod service;
pub mod settings;
pub mod types;

pub use amount::AmountParser;
pub use self::core::{Ledger, TransactionManager, TransactionStorage};
pub use service::{PaymentOutcome, PaymentRequest, PaymentService};
pub use settings::{Settings, SettingsHandle};
pub use types::{
    AccountId, AmountError, LedgerError, StorageError, Transaction, TransactionErrorKind,
    TransferError,
};
