//! Sliding-window transfer rate limit
//!
//! Each account keeps the instants of its recent transfers. Entries older
//! than the window are pruned lazily whenever the account is checked.

use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::metrics::Metrics;
use crate::settings::SettingsHandle;
use crate::types::AccountId;

#[derive(Debug)]
pub struct RateLimitManager {
    windows: DashMap<AccountId, VecDeque<Instant>>,
    settings: SettingsHandle,
    metrics: Metrics,
}

fn prune(window: &mut VecDeque<Instant>, length: std::time::Duration, now: Instant) {
    while window
        .front()
        .is_some_and(|sent| now.saturating_duration_since(*sent) > length)
    {
        window.pop_front();
    }
}

impl RateLimitManager {
    pub fn new(settings: SettingsHandle, metrics: Metrics) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
            metrics,
        }
    }

    /// Number of transfers `account` made inside the current window
    fn recent(&self, account: AccountId) -> usize {
        let length = self.settings.current().rate_limit.window();
        let now = Instant::now();
        match self.windows.get_mut(&account) {
            Some(mut window) => {
                prune(&mut window, length, now);
                window.len()
            }
            None => 0,
        }
    }

    /// Whether `account` already used up its window
    ///
    /// A positive answer is counted as a rate-limit hit.
    pub fn is_rate_limited(&self, account: AccountId) -> bool {
        let settings = self.settings.current();
        if !settings.rate_limit.enabled {
            return false;
        }
        let limited = self.recent(account) >= settings.rate_limit.max_transactions as usize;
        if limited {
            self.metrics.record_rate_limit_hit();
        }
        limited
    }

    /// Count a transfer made by `account` now
    pub fn record_transaction(&self, account: AccountId) {
        if !self.settings.current().rate_limit.enabled {
            return;
        }
        self.windows
            .entry(account)
            .or_default()
            .push_back(Instant::now());
    }

    /// Transfers `account` may still make in the current window
    ///
    /// `u32::MAX` when rate limiting is disabled.
    pub fn remaining_transactions(&self, account: AccountId) -> u32 {
        let settings = self.settings.current();
        if !settings.rate_limit.enabled {
            return u32::MAX;
        }
        let used = u32::try_from(self.recent(account)).unwrap_or(u32::MAX);
        settings.rate_limit.max_transactions.saturating_sub(used)
    }

    /// Prune every window and forget accounts left with an empty one
    ///
    /// # Returns
    ///
    /// Number of accounts forgotten.
    pub fn cleanup_idle(&self) -> usize {
        let length = self.settings.current().rate_limit.window();
        let now = Instant::now();
        let mut removed = 0;
        self.windows.retain(|_, window| {
            prune(window, length, now);
            removed += usize::from(window.is_empty());
            !window.is_empty()
        });
        removed
    }

    /// Accounts with a tracked window
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn clear_account(&self, account: AccountId) {
        self.windows.remove(&account);
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::time::Duration;
    use uuid::Uuid;

    fn limiter(max: u32, window_secs: u64) -> RateLimitManager {
        let mut settings = Settings::default();
        settings.rate_limit.max_transactions = max;
        settings.rate_limit.window_secs = window_secs;
        RateLimitManager::new(SettingsHandle::new(settings), Metrics::new().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window() {
        let limiter = limiter(3, 60);
        let account = Uuid::new_v4();

        for _ in 0..3 {
            assert!(!limiter.is_rate_limited(account));
            limiter.record_transaction(account);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        // t = 30s, transfers at 0s, 10s, 20s
        assert!(limiter.is_rate_limited(account));
        assert_eq!(limiter.remaining_transactions(account), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        // t = 60s, the first transfer is exactly one window old and still counts
        assert!(limiter.is_rate_limited(account));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!limiter.is_rate_limited(account));
        assert_eq!(limiter.remaining_transactions(account), 1);
        assert_eq!(limiter.metrics.snapshot().rate_limit_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_one_window_old_still_counts() {
        let limiter = limiter(1, 60);
        let account = Uuid::new_v4();

        limiter.record_transaction(account);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(limiter.is_rate_limited(account));
        assert_eq!(limiter.remaining_transactions(account), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounts_are_independent() {
        let limiter = limiter(1, 60);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        limiter.record_transaction(a);

        assert!(limiter.is_rate_limited(a));
        assert!(!limiter.is_rate_limited(b));

        limiter.clear_account(a);
        assert!(!limiter.is_rate_limited(a));
    }

    #[tokio::test]
    async fn test_disabled_limiter_is_unbounded() {
        let mut settings = Settings::default();
        settings.rate_limit.enabled = false;
        let limiter = RateLimitManager::new(SettingsHandle::new(settings), Metrics::new().unwrap());
        let account = Uuid::new_v4();

        for _ in 0..100 {
            limiter.record_transaction(account);
        }

        assert!(!limiter.is_rate_limited(account));
        assert_eq!(limiter.remaining_transactions(account), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_idle_forgets_quiet_accounts() {
        let limiter = limiter(5, 60);
        let (quiet, busy) = (Uuid::new_v4(), Uuid::new_v4());

        limiter.record_transaction(quiet);
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.record_transaction(busy);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(limiter.cleanup_idle(), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.remaining_transactions(busy), 4);
    }
}
