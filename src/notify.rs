//! Notification collaborator
//!
//! The engine and the payment service report transfer outcomes through a
//! [`Notifier`]. Delivery (chat message, webhook, mail) belongs to the
//! implementation; the pipeline only decides who is told what.

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::{AccountId, CurrencyCode, Transaction, TransactionId};

/// Who a notice is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Account(AccountId),
    /// Privileged observers (administrators)
    Operators,
}

/// Something worth telling a recipient
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Sender side of a completed transfer
    PaymentSent { transaction: Transaction },
    /// Receiver side of a completed transfer
    PaymentReceived { transaction: Transaction },
    /// A transfer failed; `key` is the stable error key
    TransferFailed {
        currency: CurrencyCode,
        amount: Decimal,
        key: &'static str,
    },
    /// A pending confirmation timed out before being confirmed
    ConfirmationExpired,
    /// Highest severity: a rollback failed and balances need manual reconciliation
    CriticalRollbackFailure {
        transaction: TransactionId,
        detail: String,
    },
    /// Transfers received while the account was away
    OfflinePayments { transactions: Vec<Transaction> },
}

/// Delivery channel for notices
///
/// Must not block: implementations hand work off rather than waiting on I/O.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: Recipient, notice: Notice);
}

/// Notifier that only writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, recipient: Recipient, notice: Notice) {
        match (&recipient, &notice) {
            (_, Notice::CriticalRollbackFailure { transaction, detail }) => {
                tracing::error!(
                    recipient = ?recipient,
                    transaction = %transaction,
                    detail = %detail,
                    "CRITICAL: failed to roll back transaction"
                );
            }
            (_, Notice::TransferFailed { key, .. }) => {
                tracing::warn!(recipient = ?recipient, key, "Transfer failed");
            }
            _ => tracing::debug!(recipient = ?recipient, notice = ?notice, "Notice"),
        }
    }
}

/// Notifier that keeps every notice in memory, for assertions
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(Recipient, Notice)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in delivery order
    pub fn notices(&self) -> Vec<(Recipient, Notice)> {
        self.notices.lock().clone()
    }

    /// Notices addressed to `recipient`
    pub fn notices_for(&self, recipient: Recipient) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|(to, _)| *to == recipient)
            .map(|(_, notice)| notice.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, recipient: Recipient, notice: Notice) {
        self.notices.lock().push((recipient, notice));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_recording_notifier_filters_by_recipient() {
        let notifier = RecordingNotifier::new();
        let account = Uuid::new_v4();

        notifier.notify(Recipient::Account(account), Notice::ConfirmationExpired);
        notifier.notify(
            Recipient::Operators,
            Notice::CriticalRollbackFailure {
                transaction: Uuid::nil(),
                detail: "ledger down".to_string(),
            },
        );

        assert_eq!(notifier.notices().len(), 2);
        assert_eq!(
            notifier.notices_for(Recipient::Account(account)),
            vec![Notice::ConfirmationExpired]
        );
    }
}
