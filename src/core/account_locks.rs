//! Per-account serialization
//!
//! The ledger offers no multi-key atomicity, so two transfers touching the
//! same account must not interleave their read-check-debit sequences. Each
//! account gets its own async mutex; a transfer holds the mutexes of both of
//! its parties for the duration of the ledger calls.
//!
//! Locks are always acquired in ascending account order, which rules out
//! lock-order deadlocks between `a -> b` and `b -> a` transfers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::AccountId;

/// Registry of per-account async mutexes
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

/// Guards held for the lifetime of one transfer
#[derive(Debug)]
pub struct TransferGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account: AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the locks of every account in `accounts`
    ///
    /// # Arguments
    ///
    /// * `accounts` - Parties of the transfer; duplicates are ignored
    ///
    /// # Returns
    ///
    /// A guard releasing every lock when dropped.
    pub async fn acquire(&self, accounts: &[AccountId]) -> TransferGuard {
        let mut ordered = accounts.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for account in ordered {
            guards.push(self.lock_for(account).lock_owned().await);
        }
        TransferGuard { _guards: guards }
    }

    /// Drop the mutexes nobody is holding or waiting on
    ///
    /// # Returns
    ///
    /// Number of mutexes dropped.
    pub fn prune_idle(&self) -> usize {
        let mut removed = 0;
        self.locks.retain(|_, lock| {
            let in_use = Arc::strong_count(lock) > 1;
            removed += usize::from(!in_use);
            in_use
        });
        removed
    }

    /// Run [`Self::prune_idle`] every `period` until `token` fires
    pub fn spawn_pruner(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
        span: tracing::Span,
    ) -> JoinHandle<()> {
        let locks = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = locks.prune_idle();
                        if removed > 0 {
                            tracing::debug!(parent: &span, removed, "Pruned idle account locks");
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
