//! Minimum delay between two transfers of the same sender

use dashmap::DashMap;
use tokio::time::Instant;

use crate::metrics::Metrics;
use crate::settings::SettingsHandle;
use crate::types::{AccountId, Privileges};

/// Tracks when each account last sent money
#[derive(Debug)]
pub struct CooldownManager {
    last_transfer: DashMap<AccountId, Instant>,
    settings: SettingsHandle,
    metrics: Metrics,
}

impl CooldownManager {
    pub fn new(settings: SettingsHandle, metrics: Metrics) -> Self {
        Self {
            last_transfer: DashMap::new(),
            settings,
            metrics,
        }
    }

    /// Whether `account` must wait before sending again
    ///
    /// Always false when cooldowns are disabled or the account bypasses them.
    /// A positive answer is counted as a cooldown hit.
    pub fn is_on_cooldown(&self, account: AccountId, privileges: Privileges) -> bool {
        let settings = self.settings.current();
        if !settings.cooldown.enabled || privileges.bypass_cooldown {
            return false;
        }
        let active = self
            .last_transfer
            .get(&account)
            .is_some_and(|last| last.elapsed() < settings.cooldown.duration());
        if active {
            self.metrics.record_cooldown_hit();
        }
        active
    }

    /// Start the cooldown of `account` now
    pub fn set_cooldown(&self, account: AccountId, privileges: Privileges) {
        if !self.settings.current().cooldown.enabled || privileges.bypass_cooldown {
            return;
        }
        self.last_transfer.insert(account, Instant::now());
    }

    /// Whole seconds left, rounded up (zero when not on cooldown)
    pub fn remaining_cooldown(&self, account: AccountId) -> u64 {
        let duration = self.settings.current().cooldown.duration();
        let Some(last) = self.last_transfer.get(&account).map(|last| *last) else {
            return 0;
        };
        let remaining = duration.saturating_sub(last.elapsed());
        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
    }

    pub fn remove(&self, account: AccountId) {
        self.last_transfer.remove(&account);
    }

    pub fn clear(&self) {
        self.last_transfer.clear();
    }

    /// Forget accounts whose cooldown has run out
    ///
    /// # Returns
    ///
    /// Number of accounts forgotten.
    pub fn cleanup_expired(&self) -> usize {
        let duration = self.settings.current().cooldown.duration();
        let mut removed = 0;
        self.last_transfer.retain(|_, last| {
            let active = last.elapsed() < duration;
            removed += usize::from(!active);
            active
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.last_transfer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_transfer.is_empty()
    }
}
