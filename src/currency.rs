//! Currency admission policy
//!
//! A currency can be used for transfers when the ledger knows it, it is not
//! blocked, and the allow-list is either empty or names it. Ledger existence
//! answers are cached for `cache.currency_validation_ttl_secs`, negative
//! answers included.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::core::Ledger;
use crate::settings::SettingsHandle;
use crate::types::{CurrencyCode, LedgerError, TransferError};

pub struct CurrencyPolicy {
    ledger: Arc<dyn Ledger>,
    settings: SettingsHandle,
    known: DashMap<CurrencyCode, (bool, Instant)>,
    span: tracing::Span,
}

impl std::fmt::Debug for CurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrencyPolicy")
            .field("cached", &self.known.len())
            .finish()
    }
}

impl CurrencyPolicy {
    pub fn new(ledger: Arc<dyn Ledger>, settings: SettingsHandle) -> Self {
        Self {
            ledger,
            settings,
            known: DashMap::new(),
            span: tracing::Span::none(),
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Whether the ledger knows `currency`
    ///
    /// Ledger failures are returned as-is and never cached.
    pub async fn exists(&self, currency: &str) -> Result<bool, LedgerError> {
        if currency.is_empty() {
            return Ok(false);
        }
        let settings = self.settings.current();
        let caching = settings.cache.currency_validation_enabled;

        if caching {
            let ttl = settings.cache.currency_validation_ttl();
            if let Some(entry) = self.known.get(currency) {
                let (exists, checked_at) = *entry;
                if checked_at.elapsed() < ttl {
                    return Ok(exists);
                }
            }
        }

        let exists = self.ledger.currency_exists(currency).await?;
        if caching {
            self.known.insert(currency.to_string(), (exists, Instant::now()));
        }
        Ok(exists)
    }

    pub fn is_blocked(&self, currency: &str) -> bool {
        self.settings.current().currencies.blocked.contains(currency)
    }

    /// Allow-list check; an empty list allows everything
    pub fn is_allowed(&self, currency: &str) -> bool {
        let settings = self.settings.current();
        let allowed = &settings.currencies.allowed;
        allowed.is_empty() || allowed.contains(currency)
    }

    /// Admit `currency` for a transfer
    ///
    /// # Errors
    ///
    /// * `InvalidCurrency` - Unknown to the ledger
    /// * `CurrencyBlocked` - On the block list
    /// * `CurrencyNotAllowed` - Missing from a non-empty allow-list
    /// * `Ledger` - The existence check itself failed
    pub async fn validate(&self, currency: &str) -> Result<(), TransferError> {
        let rejection = if !self.exists(currency).await? {
            TransferError::InvalidCurrency {
                currency: currency.to_string(),
            }
        } else if self.is_blocked(currency) {
            TransferError::CurrencyBlocked {
                currency: currency.to_string(),
            }
        } else if !self.is_allowed(currency) {
            TransferError::CurrencyNotAllowed {
                currency: currency.to_string(),
            }
        } else {
            return Ok(());
        };
        tracing::debug!(parent: &self.span, currency, reason = rejection.key(), "Currency rejected");
        Err(rejection)
    }

    /// Forget every cached existence answer
    pub fn clear_cache(&self) {
        self.known.clear();
    }
}
