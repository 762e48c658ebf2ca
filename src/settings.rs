//! Engine configuration
//!
//! One [`Settings`] tree covering every tunable of the pipeline. All sections
//! deserialize with `#[serde(default)]`, so a config file only needs to name
//! the values it overrides. Loading merges an optional TOML file with
//! `TRANSFER__SECTION__KEY` environment overrides.
//!
//! Components never hold a `Settings` by value: they read the current snapshot
//! from a shared [`SettingsHandle`] at the start of each operation, so a reload
//! never changes the rules of a transfer that is already executing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub tax: TaxSettings,
    pub limits: LimitSettings,
    pub cooldown: CooldownSettings,
    pub rate_limit: RateLimitSettings,
    pub confirmation: ConfirmationSettings,
    pub cache: CacheSettings,
    pub persistence: PersistenceSettings,
    pub currencies: CurrencySettings,
    pub formats: FormatSettings,
    pub logging: LoggingSettings,
}

/// Worker pool and transfer policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Run engine bodies on the worker pool when callers allow it
    pub async_operations: bool,
    /// Worker pool size (concurrent transfer bodies)
    pub worker_threads: usize,
    /// Grace period given to in-flight transfers on shutdown
    pub shutdown_grace_secs: u64,
    pub allow_self_transfer: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            async_operations: true,
            worker_threads: num_cpus::get(),
            shutdown_grace_secs: 10,
            allow_self_transfer: false,
        }
    }
}

impl EngineSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Transfer tax: `amount * percentage / 100 + fixed` once `amount >= minimum_for_tax`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaxSettings {
    pub enabled: bool,
    pub percentage: Decimal,
    pub fixed: Decimal,
    pub minimum_for_tax: Decimal,
}

impl Default for TaxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            percentage: Decimal::ZERO,
            fixed: Decimal::ZERO,
            minimum_for_tax: Decimal::ZERO,
        }
    }
}

impl TaxSettings {
    /// Tax owed on `amount` under these settings, `None` on overflow
    pub fn tax_for(&self, amount: Decimal) -> Option<Decimal> {
        if !self.enabled || amount < self.minimum_for_tax {
            return Some(Decimal::ZERO);
        }
        let rate = self.percentage.checked_div(Decimal::ONE_HUNDRED)?;
        amount.checked_mul(rate)?.checked_add(self.fixed)
    }

    /// `amount` plus its tax, `None` when that does not fit in a [`Decimal`]
    pub fn total_for(&self, amount: Decimal) -> Option<Decimal> {
        amount.checked_add(self.tax_for(amount)?)
    }
}

/// Per-transfer amount bounds (`maximum == 0` means unbounded)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub enabled: bool,
    pub minimum: Decimal,
    pub maximum: Decimal,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum: Decimal::ONE,
            maximum: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CooldownSettings {
    pub enabled: bool,
    pub seconds: u64,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            seconds: 5,
        }
    }
}

impl CooldownSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_transactions: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_transactions: 10,
            window_secs: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfirmationSettings {
    pub enabled: bool,
    pub threshold: Decimal,
    pub timeout_secs: u64,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Decimal::new(1_000_000, 0),
            timeout_secs: 30,
        }
    }
}

impl ConfirmationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Balance cache and currency-validation cache
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub balance_enabled: bool,
    pub balance_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub currency_validation_enabled: bool,
    pub currency_validation_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            balance_enabled: true,
            balance_ttl_secs: 30,
            cleanup_interval_secs: 300,
            currency_validation_enabled: true,
            currency_validation_ttl_secs: 300,
        }
    }
}

impl CacheSettings {
    pub fn balance_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn currency_validation_ttl(&self) -> Duration {
        Duration::from_secs(self.currency_validation_ttl_secs)
    }
}

/// Transaction history persistence
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Persist completed transactions at all
    pub save_history: bool,
    /// Queue records and flush them periodically instead of writing each one
    pub batch_writes: bool,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// History older than this is purged by `purge_history`
    pub retention_days: u32,
    /// Default page size for history queries
    pub max_history: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            save_history: true,
            batch_writes: true,
            batch_size: 100,
            flush_interval_ms: 5_000,
            retention_days: 30,
            max_history: 100,
        }
    }
}

impl PersistenceSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Currency policy: an empty `allowed` set allows every existing currency
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct CurrencySettings {
    pub blocked: BTreeSet<String>,
    pub allowed: BTreeSet<String>,
}

/// Amount suffixes and display formatting
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FormatSettings {
    pub suffixes_enabled: bool,
    /// Lower-case suffix to multiplier
    pub suffixes: BTreeMap<String, Decimal>,
    pub allow_decimals: bool,
    pub decimal_places: u32,
    pub locale: String,
}

impl Default for FormatSettings {
    fn default() -> Self {
        let suffixes = [
            ("k", Decimal::new(1_000, 0)),
            ("m", Decimal::new(1_000_000, 0)),
            ("b", Decimal::new(1_000_000_000, 0)),
            ("t", Decimal::new(1_000_000_000_000, 0)),
        ]
        .into_iter()
        .map(|(suffix, factor)| (suffix.to_string(), factor))
        .collect();

        Self {
            suffixes_enabled: true,
            suffixes,
            allow_decimals: true,
            decimal_places: 2,
            locale: "en_US".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log every completed transfer at info level
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { console: true }
    }
}

impl Settings {
    /// Load settings from an optional file plus `TRANSFER__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                ::config::Environment::with_prefix("TRANSFER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings.validated())
    }

    /// Replace unusable values with defaults, warning about each one
    pub fn validated(mut self) -> Self {
        let defaults = Settings::default();

        if self.engine.worker_threads == 0 {
            tracing::warn!(
                default = defaults.engine.worker_threads,
                "Invalid engine.worker_threads (0), using default"
            );
            self.engine.worker_threads = defaults.engine.worker_threads;
        }
        if self.persistence.batch_size == 0 {
            tracing::warn!(
                default = defaults.persistence.batch_size,
                "Invalid persistence.batch_size (0), using default"
            );
            self.persistence.batch_size = defaults.persistence.batch_size;
        }
        if self.persistence.flush_interval_ms == 0 {
            tracing::warn!(
                default = defaults.persistence.flush_interval_ms,
                "Invalid persistence.flush_interval_ms (0), using default"
            );
            self.persistence.flush_interval_ms = defaults.persistence.flush_interval_ms;
        }
        if self.cache.cleanup_interval_secs == 0 {
            tracing::warn!(
                default = defaults.cache.cleanup_interval_secs,
                "Invalid cache.cleanup_interval_secs (0), using default"
            );
            self.cache.cleanup_interval_secs = defaults.cache.cleanup_interval_secs;
        }
        if self.rate_limit.max_transactions == 0 {
            tracing::warn!(
                default = defaults.rate_limit.max_transactions,
                "Invalid rate_limit.max_transactions (0), using default"
            );
            self.rate_limit.max_transactions = defaults.rate_limit.max_transactions;
        }
        self.formats.suffixes = self
            .formats
            .suffixes
            .into_iter()
            .map(|(suffix, factor)| (suffix.to_lowercase(), factor))
            .collect();

        self
    }
}

/// Shared, swappable settings snapshot
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Snapshot of the settings in force right now
    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.inner.read())
    }

    /// Install new settings; operations already holding a snapshot are unaffected
    pub fn replace(&self, settings: Settings) {
        *self.inner.write() = Arc::new(settings.validated());
        tracing::info!("Settings reloaded");
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
