//! # Prometheus Metrics
//!
//! Counters for the transfer pipeline: transaction outcomes, balance cache
//! efficiency, persistence batches, and gate rejections. All metrics live in
//! a dedicated [`prometheus::Registry`] prefixed `transfer` so several engines
//! in one process (tests, load runs) never collide.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub transactions_total: u64,
    pub transactions_success: u64,
    pub transactions_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub batch_operations: u64,
    pub batched_records: u64,
    pub rate_limit_hits: u64,
    pub cooldown_hits: u64,
    pub rollback_failures: u64,
    pub storage_failures: u64,
}

impl MetricsSnapshot {
    /// Cache hit ratio in `[0, 1]`, zero before any lookup
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Share of processed transactions that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.transactions_total == 0 {
            0.0
        } else {
            self.transactions_success as f64 / self.transactions_total as f64
        }
    }
}

/// Holds all metric handles for one engine instance
///
/// Clone-friendly: prometheus handles are reference counted, so clones share
/// the same underlying counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    transactions_total: IntCounter,
    transactions_success: IntCounter,
    transactions_failed: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    batch_operations: IntCounter,
    batched_records: IntCounter,
    rate_limit_hits: IntCounter,
    cooldown_hits: IntCounter,
    rollback_failures: IntCounter,
    storage_failures: IntCounter,
    processing_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("transfer".into()), None)?;

        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "transaction_processing_seconds",
                "Time spent executing a transfer in the engine",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(processing_seconds.clone()))?;

        Ok(Self {
            transactions_total: counter(
                &registry,
                "transactions_total",
                "Transfers processed by the engine",
            )?,
            transactions_success: counter(
                &registry,
                "transactions_success_total",
                "Transfers that completed",
            )?,
            transactions_failed: counter(
                &registry,
                "transactions_failed_total",
                "Transfers that failed for any reason",
            )?,
            cache_hits: counter(&registry, "cache_hits_total", "Balance cache hits")?,
            cache_misses: counter(&registry, "cache_misses_total", "Balance cache misses")?,
            batch_operations: counter(
                &registry,
                "batch_operations_total",
                "Batches written to storage",
            )?,
            batched_records: counter(
                &registry,
                "batched_records_total",
                "Transaction records written through batches",
            )?,
            rate_limit_hits: counter(
                &registry,
                "rate_limit_hits_total",
                "Transfers rejected by the rate limiter",
            )?,
            cooldown_hits: counter(
                &registry,
                "cooldown_hits_total",
                "Transfers rejected by the cooldown gate",
            )?,
            rollback_failures: counter(
                &registry,
                "rollback_failures_total",
                "Compensating rollbacks that failed and need manual reconciliation",
            )?,
            storage_failures: counter(
                &registry,
                "storage_failures_total",
                "Failed storage writes (records re-queued)",
            )?,
            processing_seconds,
            registry,
        })
    }

    pub fn record_transaction(&self, success: bool, elapsed: std::time::Duration) {
        self.transactions_total.inc();
        if success {
            self.transactions_success.inc();
        } else {
            self.transactions_failed.inc();
        }
        self.processing_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_batch(&self, size: usize) {
        self.batch_operations.inc();
        self.batched_records.inc_by(size as u64);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.inc();
    }

    pub fn record_cooldown_hit(&self) {
        self.cooldown_hits.inc();
    }

    pub fn record_rollback_failure(&self) {
        self.rollback_failures.inc();
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_total: self.transactions_total.get(),
            transactions_success: self.transactions_success.get(),
            transactions_failed: self.transactions_failed.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            batch_operations: self.batch_operations.get(),
            batched_records: self.batched_records.get(),
            rate_limit_hits: self.rate_limit_hits.get(),
            cooldown_hits: self.cooldown_hits.get(),
            rollback_failures: self.rollback_failures.get(),
            storage_failures: self.storage_failures.get(),
        }
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
