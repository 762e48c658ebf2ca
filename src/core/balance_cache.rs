//! Short-lived balance cache in front of the ledger
//!
//! Balances are cached per `(account, currency)` for the configured TTL and
//! dropped as soon as the engine mutates them. Every lookup is counted as a
//! hit or a miss in [`Metrics`].
//!
//! Reads run outside any account lock, so a read can finish after the
//! balance it saw was changed and invalidated. Every invalidation bumps an
//! epoch, and a read only fills the cache if no invalidation happened while
//! it was waiting on the ledger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Ledger;
use crate::metrics::Metrics;
use crate::settings::SettingsHandle;
use crate::types::{AccountId, CurrencyCode, LedgerError};

/// A balance as last read from the ledger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedBalance {
    pub value: Decimal,
    pub fetched_at: Instant,
}

/// Two-level cache: account to currency to balance
pub struct BalanceCache {
    ledger: Arc<dyn Ledger>,
    settings: SettingsHandle,
    metrics: Metrics,
    entries: DashMap<AccountId, DashMap<CurrencyCode, CachedBalance>>,
    epoch: AtomicU64,
    span: tracing::Span,
}

impl std::fmt::Debug for BalanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl BalanceCache {
    pub fn new(ledger: Arc<dyn Ledger>, settings: SettingsHandle, metrics: Metrics) -> Self {
        Self {
            ledger,
            settings,
            metrics,
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
            span: tracing::Span::none(),
        }
    }

    /// Emit this cache's events under `span`
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    fn fresh(&self, account: AccountId, currency: &str) -> Option<Decimal> {
        let ttl = self.settings.current().cache.balance_ttl();
        let accounts = self.entries.get(&account)?;
        let cached = accounts.get(currency)?;
        (cached.fetched_at.elapsed() < ttl).then_some(cached.value)
    }

    /// Balance of `account` in `currency`, served from cache while fresh
    ///
    /// # Errors
    ///
    /// Propagates the ledger error on a miss; nothing is cached in that case.
    pub async fn get_balance(
        &self,
        account: AccountId,
        currency: &str,
    ) -> Result<Decimal, LedgerError> {
        if !self.settings.current().cache.balance_enabled {
            return self.ledger.balance(account, currency).await;
        }

        if let Some(value) = self.fresh(account, currency) {
            self.metrics.record_cache_hit();
            return Ok(value);
        }

        self.metrics.record_cache_miss();
        let started = self.epoch.load(Ordering::Acquire);
        let value = self.ledger.balance(account, currency).await?;

        // the shard guard orders this check against a concurrent invalidate
        let accounts = self.entries.entry(account).or_default();
        if self.epoch.load(Ordering::Acquire) == started {
            accounts.insert(
                currency.to_string(),
                CachedBalance {
                    value,
                    fetched_at: Instant::now(),
                },
            );
        } else {
            tracing::trace!(
                parent: &self.span,
                account = %account,
                currency,
                "Dropped stale balance read"
            );
        }
        Ok(value)
    }

    /// Bump the epoch before removing, so reads already in flight are not cached
    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn invalidate(&self, account: AccountId, currency: &str) {
        self.bump_epoch();
        if let Some(accounts) = self.entries.get(&account) {
            accounts.remove(currency);
        }
    }

    pub fn invalidate_account(&self, account: AccountId) {
        self.bump_epoch();
        self.entries.remove(&account);
    }

    /// Remove expired balances and accounts left without any
    ///
    /// # Returns
    ///
    /// Number of balances removed.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.settings.current().cache.balance_ttl();
        let mut removed = 0;
        self.entries.retain(|_, accounts| {
            let before = accounts.len();
            accounts.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
            removed += before - accounts.len();
            !accounts.is_empty()
        });
        removed
    }

    pub fn clear(&self) {
        self.bump_epoch();
        self.entries.clear();
    }

    /// Number of cached balances across all accounts
    pub fn len(&self) -> usize {
        self.entries.iter().map(|accounts| accounts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`Self::cleanup_expired`] every `cleanup_interval` until `token` fires
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.settings.current().cache.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            tracing::debug!(parent: &cache.span, removed, "Swept expired balances");
                        }
                    }
                }
            }
        })
    }
}
