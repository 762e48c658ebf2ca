//! Synthetic load against a running engine
//!
//! A [`LoadTester`] drives random transfers between simulated accounts
//! through [`TransactionManager::process_transaction`] and reports
//! throughput and success rate. Three shapes are supported:
//!
//! - `Stress` - `concurrency` tasks at once, each sending
//!   `transactions_per_task` transfers
//! - `Ramp` - the same, repeated with a growing number of tasks from
//!   `initial` to `max`, pausing `step_delay` between steps
//! - `Benchmark` - named scenarios with a fixed amount each, run in order
//!
//! Only one test runs per tester at a time. Transfers bypass the caller-side
//! gates, so cooldowns and rate limits do not throttle a run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::TransactionManager;
use crate::memory::InMemoryLedger;
use crate::types::{AccountId, CurrencyCode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadTestError {
    #[error("A load test is already running")]
    AlreadyRunning,

    #[error("Invalid load test config: {0}")]
    InvalidConfig(String),
}

/// One step of a benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkScenario {
    pub name: String,
    pub concurrency: usize,
    pub transactions_per_task: usize,
    pub amount: Decimal,
    pub delay_between: Duration,
    pub delay_after: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadTestKind {
    Stress,
    Ramp {
        initial: usize,
        max: usize,
        increment: usize,
        step_delay: Duration,
    },
    Benchmark { scenarios: Vec<BenchmarkScenario> },
}

impl LoadTestKind {
    fn label(&self) -> &'static str {
        match self {
            LoadTestKind::Stress => "stress",
            LoadTestKind::Ramp { .. } => "load",
            LoadTestKind::Benchmark { .. } => "benchmark",
        }
    }
}

/// Shared knobs plus the shape of the run
///
/// Stress and ramp runs draw each amount uniformly from
/// `[min_amount, max_amount]` at two decimal places.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestConfig {
    pub currency: CurrencyCode,
    pub concurrency: usize,
    pub transactions_per_task: usize,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub delay_between: Duration,
    pub kind: LoadTestKind,
}

impl LoadTestConfig {
    pub fn stress(currency: impl Into<CurrencyCode>) -> Self {
        Self {
            currency: currency.into(),
            concurrency: 10,
            transactions_per_task: 100,
            min_amount: Decimal::ONE,
            max_amount: Decimal::new(1000, 0),
            delay_between: Duration::ZERO,
            kind: LoadTestKind::Stress,
        }
    }

    pub fn with_kind(mut self, kind: LoadTestKind) -> Self {
        self.kind = kind;
        self
    }

    fn validate(&self, accounts: usize) -> Result<(), LoadTestError> {
        let invalid = |reason: &str| Err(LoadTestError::InvalidConfig(reason.to_string()));
        if accounts < 2 {
            return invalid("at least two accounts are needed");
        }
        if self.min_amount <= Decimal::ZERO || self.min_amount > self.max_amount {
            return invalid("amount range must be positive and ordered");
        }
        match &self.kind {
            LoadTestKind::Stress if self.concurrency == 0 => invalid("concurrency must be positive"),
            LoadTestKind::Ramp {
                initial,
                max,
                increment,
                ..
            } if *initial == 0 || *increment == 0 || initial > max => {
                invalid("ramp needs 0 < initial <= max and a positive increment")
            }
            LoadTestKind::Benchmark { scenarios }
                if scenarios
                    .iter()
                    .any(|s| s.concurrency == 0 || s.amount <= Decimal::ZERO) =>
            {
                invalid("every scenario needs a positive concurrency and amount")
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestResult {
    pub test_id: String,
    pub elapsed: Duration,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Sum of per-transfer latencies
    pub processing: Duration,
}

impl LoadTestResult {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn transactions_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total as f64 / secs
        }
    }

    pub fn average_processing(&self) -> Duration {
        match u32::try_from(self.total) {
            Ok(total) if total > 0 => self.processing / total,
            _ => Duration::ZERO,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Test: {} | Time: {}ms | Transactions: {} | Success: {:.2}% | TPS: {:.2} | Avg Time: {:.2}ms",
            self.test_id,
            self.elapsed.as_millis(),
            self.total,
            self.success_rate() * 100.0,
            self.transactions_per_second(),
            self.average_processing().as_secs_f64() * 1000.0,
        )
    }
}

#[derive(Debug, Default)]
struct Tally {
    total: AtomicU64,
    succeeded: AtomicU64,
    processing_micros: AtomicU64,
}

/// Clears the running flag however the run ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Seed `count` accounts holding 1M to 10M of `currency`
pub fn simulated_accounts(ledger: &InMemoryLedger, currency: &str, count: usize) -> Vec<AccountId> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let account = uuid::Uuid::new_v4();
            let balance = Decimal::from(rng.gen_range(1_000_000u64..=10_000_000));
            ledger.set_balance(account, currency, balance);
            account
        })
        .collect()
}

pub struct LoadTester {
    engine: Arc<TransactionManager>,
    accounts: Vec<AccountId>,
    running: AtomicBool,
    results: DashMap<String, LoadTestResult>,
}

impl std::fmt::Debug for LoadTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTester")
            .field("accounts", &self.accounts.len())
            .field("running", &self.is_running())
            .field("results", &self.results.len())
            .finish()
    }
}

impl LoadTester {
    /// Tester moving money between `accounts`, which must already hold funds
    pub fn new(engine: Arc<TransactionManager>, accounts: Vec<AccountId>) -> Self {
        Self {
            engine,
            accounts,
            running: AtomicBool::new(false),
            results: DashMap::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the current run to stop; tasks finish their transfer in progress
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Stopping load test");
        }
    }

    /// Results of every finished run, oldest first
    pub fn results(&self) -> Vec<LoadTestResult> {
        let mut results: Vec<LoadTestResult> =
            self.results.iter().map(|entry| entry.value().clone()).collect();
        results.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        results
    }

    pub fn clear_results(&self) {
        self.results.clear();
    }

    /// Execute one run to completion (or until [`Self::stop`])
    pub async fn run(&self, config: &LoadTestConfig) -> Result<LoadTestResult, LoadTestError> {
        config.validate(self.accounts.len())?;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LoadTestError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let test_id = format!("{}_{}", config.kind.label(), Utc::now().timestamp_millis());
        tracing::info!(test_id = %test_id, "Starting load test");
        let tally = Tally::default();
        let started = Instant::now();
        let range = (config.min_amount, config.max_amount);

        match &config.kind {
            LoadTestKind::Stress => {
                self.wave(
                    config,
                    config.concurrency,
                    range,
                    config.transactions_per_task,
                    config.delay_between,
                    &tally,
                )
                .await;
            }
            LoadTestKind::Ramp {
                initial,
                max,
                increment,
                step_delay,
            } => {
                let mut load = *initial;
                while load <= *max && self.is_running() {
                    tracing::info!(test_id = %test_id, load, "Ramp step");
                    self.wave(
                        config,
                        load,
                        range,
                        config.transactions_per_task,
                        config.delay_between,
                        &tally,
                    )
                    .await;
                    tokio::time::sleep(*step_delay).await;
                    load += increment;
                }
            }
            LoadTestKind::Benchmark { scenarios } => {
                for scenario in scenarios {
                    if !self.is_running() {
                        break;
                    }
                    tracing::info!(test_id = %test_id, scenario = %scenario.name, "Running scenario");
                    let fixed = (scenario.amount, scenario.amount);
                    self.wave(
                        config,
                        scenario.concurrency,
                        fixed,
                        scenario.transactions_per_task,
                        scenario.delay_between,
                        &tally,
                    )
                    .await;
                    tokio::time::sleep(scenario.delay_after).await;
                }
            }
        }

        let total = tally.total.load(Ordering::Relaxed);
        let succeeded = tally.succeeded.load(Ordering::Relaxed);
        let result = LoadTestResult {
            test_id: test_id.clone(),
            elapsed: started.elapsed(),
            total,
            succeeded,
            failed: total - succeeded,
            processing: Duration::from_micros(tally.processing_micros.load(Ordering::Relaxed)),
        };
        tracing::info!(summary = %result.summary(), "Load test completed");
        self.results.insert(test_id, result.clone());
        Ok(result)
    }

    /// `tasks` concurrent senders, each issuing `per_task` transfers
    async fn wave(
        &self,
        config: &LoadTestConfig,
        tasks: usize,
        amounts: (Decimal, Decimal),
        per_task: usize,
        delay: Duration,
        tally: &Tally,
    ) {
        join_all((0..tasks).map(|_| self.simulate(config, amounts, per_task, delay, tally))).await;
    }

    async fn simulate(
        &self,
        config: &LoadTestConfig,
        (min, max): (Decimal, Decimal),
        per_task: usize,
        delay: Duration,
        tally: &Tally,
    ) {
        for _ in 0..per_task {
            if !self.is_running() {
                break;
            }
            let (sender, receiver, amount) = self.pick(min, max);

            let started = Instant::now();
            let result = self
                .engine
                .process_transaction(Some(sender), receiver, &config.currency, amount, true)
                .await;
            let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

            tally.total.fetch_add(1, Ordering::Relaxed);
            tally.processing_micros.fetch_add(micros, Ordering::Relaxed);
            match result {
                Ok(_) => {
                    tally.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(kind) => tracing::debug!(reason = kind.key(), "Simulated transfer failed"),
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Random distinct pair and an amount in `[min, max]`
    fn pick(&self, min: Decimal, max: Decimal) -> (AccountId, AccountId, Decimal) {
        let mut rng = rand::thread_rng();
        let count = self.accounts.len();
        let sender = rng.gen_range(0..count);
        let mut receiver = rng.gen_range(0..count - 1);
        if receiver >= sender {
            receiver += 1;
        }
        let fraction = Decimal::new(rng.gen_range(0..=10_000), 4);
        let amount = (min + (max - min) * fraction).round_dp(2).max(min);
        (self.accounts[sender], self.accounts[receiver], amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ledger, TransactionStorage};
    use crate::memory::InMemoryStorage;
    use crate::metrics::Metrics;
    use crate::settings::{Settings, SettingsHandle};

    fn tester(accounts: usize) -> (Arc<LoadTester>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::with_currencies(["tokens"]));
        let storage: Arc<dyn TransactionStorage> = Arc::new(InMemoryStorage::new());
        let mut settings = Settings::default();
        settings.logging.console = false;
        let engine = TransactionManager::builder(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            storage,
            Metrics::new().unwrap(),
        )
        .settings(SettingsHandle::new(settings))
        .build();
        let accounts = simulated_accounts(&ledger, "tokens", accounts);
        (Arc::new(LoadTester::new(Arc::new(engine), accounts)), ledger)
    }

    fn config(kind: LoadTestKind) -> LoadTestConfig {
        let mut config = LoadTestConfig::stress("tokens").with_kind(kind);
        config.concurrency = 4;
        config.transactions_per_task = 5;
        config
    }

    #[tokio::test]
    async fn test_stress_run_counts_and_conserves() {
        let (tester, ledger) = tester(8);
        let before = ledger.total_supply("tokens");

        let result = tester.run(&config(LoadTestKind::Stress)).await.unwrap();

        assert_eq!(result.total, 20);
        assert_eq!(result.succeeded + result.failed, 20);
        assert_eq!(result.failed, 0);
        assert_eq!(ledger.total_supply("tokens"), before);
        assert!(result.test_id.starts_with("stress_"));
        assert!(!tester.is_running());
        assert_eq!(tester.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_grows_load() {
        let (tester, _) = tester(4);
        let kind = LoadTestKind::Ramp {
            initial: 1,
            max: 3,
            increment: 1,
            step_delay: Duration::from_millis(100),
        };

        let result = tester.run(&config(kind)).await.unwrap();

        // 1 + 2 + 3 tasks of 5 transfers
        assert_eq!(result.total, 30);
    }

    #[tokio::test]
    async fn test_benchmark_scenarios_use_fixed_amounts() {
        let (tester, ledger) = tester(2);
        let before = ledger.total_supply("tokens");
        let scenario = |name: &str, concurrency| BenchmarkScenario {
            name: name.to_string(),
            concurrency,
            transactions_per_task: 3,
            amount: Decimal::new(7, 0),
            delay_between: Duration::ZERO,
            delay_after: Duration::ZERO,
        };
        let kind = LoadTestKind::Benchmark {
            scenarios: vec![scenario("light", 1), scenario("heavy", 2)],
        };

        let result = tester.run(&config(kind)).await.unwrap();

        assert_eq!(result.total, 9);
        assert_eq!(ledger.total_supply("tokens"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_refused_and_stop_ends_run() {
        let (tester, _) = tester(4);
        let mut slow = config(LoadTestKind::Stress);
        slow.delay_between = Duration::from_secs(1);
        slow.transactions_per_task = 1_000;

        let background = Arc::clone(&tester);
        let running = tokio::spawn(async move { background.run(&slow).await });
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            tester.run(&config(LoadTestKind::Stress)).await,
            Err(LoadTestError::AlreadyRunning)
        );
        tester.stop();
        let result = running.await.unwrap().unwrap();
        assert!(result.total < 4_000);
        assert!(!tester.is_running());
    }

    #[rstest::rstest]
    #[case::one_account(1, LoadTestKind::Stress)]
    #[case::empty_ramp(4, LoadTestKind::Ramp { initial: 3, max: 2, increment: 1, step_delay: Duration::ZERO })]
    #[case::zero_increment(4, LoadTestKind::Ramp { initial: 1, max: 2, increment: 0, step_delay: Duration::ZERO })]
    #[tokio::test]
    async fn test_invalid_configs(#[case] accounts: usize, #[case] kind: LoadTestKind) {
        let (tester, _) = tester(accounts);
        assert!(matches!(
            tester.run(&config(kind)).await,
            Err(LoadTestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_result_rates() {
        let result = LoadTestResult {
            test_id: "stress_1".to_string(),
            elapsed: Duration::from_secs(2),
            total: 10,
            succeeded: 8,
            failed: 2,
            processing: Duration::from_millis(50),
        };
        assert!((result.success_rate() - 0.8).abs() < f64::EPSILON);
        assert!((result.transactions_per_second() - 5.0).abs() < f64::EPSILON);
        assert_eq!(result.average_processing(), Duration::from_millis(5));
        assert!(result.summary().contains("Success: 80.00%"));
    }
}
