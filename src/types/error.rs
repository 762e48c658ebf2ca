//! Error types for the transfer engine
//!
//! This module defines all error types that can occur while parsing amounts,
//! talking to the ledger and storage collaborators, and executing transfers.
//!
//! # Error Categories
//!
//! - **Amount Errors**: Malformed or out-of-bounds amounts (never retried)
//! - **Collaborator Errors**: Ledger and storage backend failures
//! - **Transaction Errors**: Engine outcomes (insufficient funds, failed transfer)
//! - **Transfer Errors**: Caller-side gate rejections wrapping all of the above
//!
//! Every caller-facing error exposes a stable `key()`. Raw error detail is for
//! operator logs only.

use rust_decimal::Decimal;
use thiserror::Error;

use super::transaction::{AccountId, TransactionId};

/// Errors produced while parsing or validating an amount
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmountError {
    /// Nothing to parse after trimming
    #[error("Amount cannot be empty")]
    Empty,

    /// The numeric portion could not be parsed
    #[error("Invalid number format: '{input}'")]
    InvalidFormat {
        /// The offending input
        input: String,
    },

    /// Zero or negative amount (checked even when limits are bypassed)
    #[error("Amount must be positive, got {amount}")]
    NonPositive {
        /// The rejected amount
        amount: Decimal,
    },

    /// Below the configured minimum
    #[error("Amount {amount} is below the minimum of {minimum}")]
    AmountTooLow {
        /// The rejected amount
        amount: Decimal,
        /// Configured minimum
        minimum: Decimal,
    },

    /// Above the configured maximum
    #[error("Amount {amount} exceeds the maximum of {maximum}")]
    AmountTooHigh {
        /// The rejected amount
        amount: Decimal,
        /// Configured maximum
        maximum: Decimal,
    },
}

impl AmountError {
    /// Create an InvalidFormat error
    pub fn invalid_format(input: &str) -> Self {
        AmountError::InvalidFormat {
            input: input.to_string(),
        }
    }

    /// Stable message key
    pub fn key(&self) -> &'static str {
        match self {
            AmountError::Empty | AmountError::InvalidFormat { .. } => "invalid-amount",
            AmountError::NonPositive { .. } => "amount-not-positive",
            AmountError::AmountTooLow { .. } => "amount-too-low",
            AmountError::AmountTooHigh { .. } => "amount-too-high",
        }
    }
}

/// Errors reported by a ledger backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// The ledger does not know this currency
    #[error("Unknown currency '{currency}'")]
    UnknownCurrency {
        /// Requested currency code
        currency: String,
    },

    /// A balance removal would drive the account below zero
    #[error("Account {account} holds {available} {currency}, cannot remove {requested}")]
    InsufficientBalance {
        /// Account being debited
        account: AccountId,
        /// Currency being debited
        currency: String,
        /// Balance before the call
        available: Decimal,
        /// Requested removal
        requested: Decimal,
    },

    /// Any other backend failure
    #[error("Ledger backend error: {message}")]
    Backend {
        /// Description of the failure
        message: String,
    },
}

impl LedgerError {
    /// Create a Backend error
    pub fn backend(message: impl Into<String>) -> Self {
        LedgerError::Backend {
            message: message.into(),
        }
    }
}

/// Errors reported by a storage backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// The backend rejected or failed the write/read
    #[error("Storage backend error: {message}")]
    Backend {
        /// Description of the failure
        message: String,
    },

    /// The backend is shut down or unreachable
    #[error("Storage is unavailable")]
    Unavailable,
}

impl StorageError {
    /// Create a Backend error
    pub fn backend(message: impl Into<String>) -> Self {
        StorageError::Backend {
            message: message.into(),
        }
    }
}

/// Failure kinds returned by the transaction engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionErrorKind {
    /// Sender balance is below `amount + tax`; nothing was mutated
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        /// Balance observed by the engine
        available: Decimal,
        /// `amount + tax`
        required: Decimal,
    },

    /// A ledger call failed; one compensating rollback was attempted
    #[error("Transaction {transaction} failed and was rolled back")]
    TransactionFailed {
        /// Id of the failed transaction
        transaction: TransactionId,
    },

    /// Anything unexpected (e.g. the worker task panicked)
    #[error("Unknown error while processing transaction")]
    UnknownError,
}

impl TransactionErrorKind {
    /// Stable error key
    pub fn key(&self) -> &'static str {
        match self {
            TransactionErrorKind::InsufficientFunds { .. } => "insufficient_funds",
            TransactionErrorKind::TransactionFailed { .. } => "transaction_failed",
            TransactionErrorKind::UnknownError => "unknown_error",
        }
    }
}

/// Rejections produced by the caller-side transfer flow
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransferError {
    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("Self-transfers are not allowed")]
    SelfTransfer,

    #[error("Currency '{currency}' does not exist")]
    InvalidCurrency { currency: String },

    #[error("Currency '{currency}' is blocked")]
    CurrencyBlocked { currency: String },

    #[error("Currency '{currency}' is not in the allowed list")]
    CurrencyNotAllowed { currency: String },

    #[error("Cooldown active, {remaining_secs}s remaining")]
    OnCooldown { remaining_secs: u64 },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("No pending confirmation")]
    NoPendingConfirmation,

    #[error("No recipients to pay")]
    NoRecipients,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Transaction(#[from] TransactionErrorKind),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl TransferError {
    /// Stable message key surfaced to end users
    pub fn key(&self) -> &'static str {
        match self {
            TransferError::Amount(e) => e.key(),
            TransferError::SelfTransfer => "self-transfer",
            TransferError::InvalidCurrency { .. } => "invalid-currency",
            TransferError::CurrencyBlocked { .. } => "currency-blocked",
            TransferError::CurrencyNotAllowed { .. } => "currency-not-allowed",
            TransferError::OnCooldown { .. } => "cooldown-active",
            TransferError::RateLimited => "rate-limit-exceeded",
            TransferError::NoPendingConfirmation => "confirmation-expired",
            TransferError::NoRecipients => "no-recipients",
            TransferError::Cancelled => "cancelled",
            TransferError::Transaction(e) => e.key(),
            TransferError::Ledger(_) => "unknown_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uuid::Uuid;

    #[rstest]
    #[case::empty(AmountError::Empty.to_string(), "Amount cannot be empty")]
    #[case::invalid_format(
        AmountError::invalid_format("abc").to_string(),
        "Invalid number format: 'abc'"
    )]
    #[case::non_positive(
        AmountError::NonPositive { amount: Decimal::new(-5, 0) }.to_string(),
        "Amount must be positive, got -5"
    )]
    #[case::too_low(
        AmountError::AmountTooLow { amount: Decimal::new(5, 1), minimum: Decimal::ONE }.to_string(),
        "Amount 0.5 is below the minimum of 1"
    )]
    #[case::insufficient_funds(
        TransactionErrorKind::InsufficientFunds { available: Decimal::new(54, 0), required: Decimal::new(55, 0) }.to_string(),
        "Insufficient funds: available 54, required 55"
    )]
    #[case::cooldown(
        TransferError::OnCooldown { remaining_secs: 3 }.to_string(),
        "Cooldown active, 3s remaining"
    )]
    #[case::ledger_backend(
        LedgerError::backend("connection reset").to_string(),
        "Ledger backend error: connection reset"
    )]
    fn test_error_display(#[case] rendered: String, #[case] expected: &str) {
        assert_eq!(rendered, expected);
    }

    #[rstest]
    #[case::invalid_amount(TransferError::Amount(AmountError::Empty), "invalid-amount")]
    #[case::non_positive(
        TransferError::Amount(AmountError::NonPositive { amount: Decimal::ZERO }),
        "amount-not-positive"
    )]
    #[case::too_high(
        TransferError::Amount(AmountError::AmountTooHigh { amount: Decimal::TEN, maximum: Decimal::ONE }),
        "amount-too-high"
    )]
    #[case::self_transfer(TransferError::SelfTransfer, "self-transfer")]
    #[case::blocked(TransferError::CurrencyBlocked { currency: "gems".into() }, "currency-blocked")]
    #[case::rate_limited(TransferError::RateLimited, "rate-limit-exceeded")]
    #[case::expired(TransferError::NoPendingConfirmation, "confirmation-expired")]
    #[case::failed(
        TransferError::Transaction(TransactionErrorKind::TransactionFailed { transaction: Uuid::nil() }),
        "transaction_failed"
    )]
    #[case::unknown(TransferError::Transaction(TransactionErrorKind::UnknownError), "unknown_error")]
    fn test_error_keys(#[case] error: TransferError, #[case] expected: &str) {
        assert_eq!(error.key(), expected);
    }

    #[test]
    fn test_amount_error_converts_into_transfer_error() {
        let error: TransferError = AmountError::Empty.into();
        assert!(matches!(error, TransferError::Amount(AmountError::Empty)));
    }
}
