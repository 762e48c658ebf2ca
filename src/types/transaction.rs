//! Transaction-related types for the transfer engine
//!
//! This module defines the transaction record produced by the engine, the
//! pending transfer held while a sender confirms, and the identifiers used
//! throughout the system.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TransactionErrorKind;

/// Account identifier
pub type AccountId = Uuid;

/// Transaction identifier (random v4 UUID, unique per execution)
pub type TransactionId = Uuid;

/// Currency code as known by the ledger (e.g. `"tokens"`)
pub type CurrencyCode = String;

/// Sentinel stored in place of the sender for system-initiated transfers
pub const SYSTEM_SENDER: AccountId = Uuid::nil();

/// Outcome of a single engine execution
pub type TransactionResult = Result<Transaction, TransactionErrorKind>;

/// A completed currency transfer
///
/// Built by the engine at execution time. Every field is fixed at
/// construction except the tax, which is attached exactly once through
/// [`Transaction::with_tax`] after the ledger calls succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub id: TransactionId,

    /// Paying account, `None` for a privileged system disbursement
    pub sender: Option<AccountId>,

    /// Receiving account
    pub receiver: AccountId,

    /// Currency moved by this transfer
    pub currency: CurrencyCode,

    /// Amount credited to the receiver (always > 0)
    pub amount: Decimal,

    /// Tax debited from the sender on top of `amount`, never credited
    tax: Decimal,

    /// Execution time
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Create a new transaction with a fresh id, the current time and no tax
    pub fn new(
        sender: Option<AccountId>,
        receiver: AccountId,
        currency: impl Into<CurrencyCode>,
        amount: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver,
            currency: currency.into(),
            amount,
            tax: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Rebuild a transaction from its persisted shape
    ///
    /// A sender equal to [`SYSTEM_SENDER`] is mapped back to `None`.
    pub fn from_record(
        id: TransactionId,
        sender: AccountId,
        receiver: AccountId,
        currency: impl Into<CurrencyCode>,
        amount: Decimal,
        tax: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender: (sender != SYSTEM_SENDER).then_some(sender),
            receiver,
            currency: currency.into(),
            amount,
            tax,
            timestamp,
        }
    }

    /// Attach the tax computed at execution time
    pub fn with_tax(mut self, tax: Decimal) -> Self {
        self.tax = tax;
        self
    }

    /// Tax charged on this transfer
    pub fn tax(&self) -> Decimal {
        self.tax
    }

    /// Total removed from the sender (`amount + tax`), `None` on overflow
    pub fn total_debit(&self) -> Option<Decimal> {
        self.amount.checked_add(self.tax)
    }

    /// Whether this transfer was initiated by the system actor
    pub fn is_system(&self) -> bool {
        self.sender.is_none()
    }

    /// Sender as stored, with the system sentinel substituted for `None`
    pub fn sender_or_sentinel(&self) -> AccountId {
        self.sender.unwrap_or(SYSTEM_SENDER)
    }

    /// Whether `account` took part in this transfer on either side
    pub fn involves(&self, account: AccountId) -> bool {
        self.receiver == account || self.sender == Some(account)
    }
}

/// A transfer awaiting explicit confirmation by its sender
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub currency: CurrencyCode,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl PendingTransaction {
    pub fn new(
        sender: AccountId,
        receiver: AccountId,
        currency: impl Into<CurrencyCode>,
        amount: Decimal,
    ) -> Self {
        Self {
            sender,
            receiver,
            currency: currency.into(),
            amount,
            created_at: Utc::now(),
        }
    }
}

/// Aggregated history for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionStats {
    pub sent_count: u64,
    pub sent_total: Decimal,
    pub received_count: u64,
    pub received_total: Decimal,
}

/// Gate bypasses held by the account initiating a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Privileges {
    /// Skip the cooldown gate and never start a cooldown
    pub bypass_cooldown: bool,

    /// Skip the configured minimum/maximum amount bounds
    pub bypass_limits: bool,
}

impl Privileges {
    /// Privileges of the system actor: every bypass granted
    pub fn system() -> Self {
        Self {
            bypass_cooldown: true,
            bypass_limits: true,
        }
    }
}
