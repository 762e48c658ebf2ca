//! In-memory collaborators
//!
//! Reference implementations of [`crate::core::Ledger`] and
//! [`crate::core::TransactionStorage`] used by the replay binary, the load
//! test harness and the test suite.

pub mod ledger;
pub mod storage;

pub use ledger::{InMemoryLedger, LedgerOp};
pub use storage::InMemoryStorage;
