//! Confirmation of large transfers
//!
//! A transfer at or above the configured threshold is parked as a
//! [`PendingTransaction`] until its sender confirms it. Each sender holds at
//! most one pending transfer:
//!
//! ```text
//! NONE ──create──▶ PENDING ──confirm──▶ NONE (payload returned)
//!                     │  ├───cancel───▶ NONE
//!                     │  └──timeout───▶ NONE (sender notified)
//!                     └──create──▶ PENDING (previous payload replaced)
//! ```
//!
//! Every slot carries a generation number. An expiry timer only removes the
//! slot it was started for, so the timer of a superseded transfer is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::task::AbortHandle;

use crate::notify::{Notice, Notifier, Recipient};
use crate::settings::SettingsHandle;
use crate::types::{AccountId, PendingTransaction};

#[derive(Debug)]
struct Slot {
    pending: PendingTransaction,
    generation: u64,
    timer: Option<AbortHandle>,
}

struct Inner {
    slots: DashMap<AccountId, Slot>,
    generations: AtomicU64,
    settings: SettingsHandle,
    notifier: Arc<dyn Notifier>,
    span: tracing::Span,
}

impl Inner {
    fn expire(&self, sender: AccountId, generation: u64) {
        let expired = self
            .slots
            .remove_if(&sender, |_, slot| slot.generation == generation)
            .is_some();
        if expired {
            tracing::debug!(parent: &self.span, sender = %sender, "Pending transfer expired");
            self.notifier
                .notify(Recipient::Account(sender), Notice::ConfirmationExpired);
        }
    }
}

/// Holds the pending transfer of each sender
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct ConfirmationManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConfirmationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationManager")
            .field("pending", &self.inner.slots.len())
            .finish()
    }
}

impl ConfirmationManager {
    pub fn new(settings: SettingsHandle, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_span(settings, notifier, tracing::Span::none())
    }

    pub fn with_span(
        settings: SettingsHandle,
        notifier: Arc<dyn Notifier>,
        span: tracing::Span,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                generations: AtomicU64::new(0),
                settings,
                notifier,
                span,
            }),
        }
    }

    /// Whether a transfer of `amount` has to be confirmed first
    pub fn requires_confirmation(&self, amount: Decimal) -> bool {
        let settings = self.inner.settings.current();
        settings.confirmation.enabled && amount >= settings.confirmation.threshold
    }

    /// Park `pending` until its sender confirms it or the timeout elapses
    ///
    /// Replaces any transfer the sender already had pending. Must be called
    /// inside a Tokio runtime.
    pub fn create_confirmation(&self, pending: PendingTransaction) {
        let sender = pending.sender;
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.settings.current().confirmation.timeout();

        let replaced = self.inner.slots.insert(
            sender,
            Slot {
                pending,
                generation,
                timer: None,
            },
        );
        if replaced.is_some() {
            tracing::debug!(parent: &self.inner.span, sender = %sender, "Pending transfer replaced");
        }

        let inner = Arc::clone(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.expire(sender, generation);
        })
        .abort_handle();

        match self.inner.slots.get_mut(&sender) {
            Some(mut slot) if slot.generation == generation => slot.timer = Some(timer),
            // already expired or replaced again
            _ => {}
        }
    }

    /// Take the sender's pending transfer, stopping its timer
    pub fn confirm(&self, sender: AccountId) -> Option<PendingTransaction> {
        let (_, slot) = self.inner.slots.remove(&sender)?;
        if let Some(timer) = slot.timer {
            timer.abort();
        }
        Some(slot.pending)
    }

    /// Discard the sender's pending transfer
    ///
    /// # Returns
    ///
    /// Whether there was one to discard.
    pub fn cancel(&self, sender: AccountId) -> bool {
        self.confirm(sender).is_some()
    }

    /// Look at the sender's pending transfer without taking it
    pub fn pending(&self, sender: AccountId) -> Option<PendingTransaction> {
        self.inner
            .slots
            .get(&sender)
            .map(|slot| slot.pending.clone())
    }

    pub fn has_pending(&self, sender: AccountId) -> bool {
        self.inner.slots.contains_key(&sender)
    }

    /// Drop every pending transfer and stop all timers
    pub fn cleanup(&self) {
        let senders: Vec<AccountId> = self.inner.slots.iter().map(|slot| *slot.key()).collect();
        for sender in senders {
            self.cancel(sender);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }
}
