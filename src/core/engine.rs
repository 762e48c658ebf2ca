//! Transaction execution
//!
//! This module provides the [`TransactionManager`], which moves money between
//! two accounts through a [`Ledger`] that only offers single-call atomicity.
//! Callers are expected to have passed every gate (cooldown, rate limit,
//! confirmation, amount bounds) before calling in.
//!
//! # Design
//!
//! One execution:
//! 1. Compute the tax from the settings snapshot taken at call time
//! 2. Lock both parties (see [`AccountLocks`])
//! 3. Read the sender balance through the [`BalanceCache`]
//! 4. Debit `amount + tax` from the sender, then credit `amount` to the receiver
//! 5. On success attach the tax and hand the record to persistence
//!
//! A failure after the debit triggers exactly one compensating re-credit of
//! the sender. If that also fails, operators receive a critical alert and the
//! transfer stays in the in-flight journal until someone resolves it.
//!
//! The rollback never reverses a receiver credit: it relies on each ledger
//! call being atomic, so a credit that returned an error credited nothing.
//!
//! # Architecture
//!
//! ```text
//! TransactionManager
//!     ├── Arc<EngineCore>
//!     │     ├── Arc<dyn Ledger>             (balances)
//!     │     ├── Arc<BalanceCache>           (sender balance reads)
//!     │     ├── Arc<PersistenceQueue>       (batched history writes)
//!     │     ├── Arc<AccountLocks>           (per-account serialization)
//!     │     └── DashMap<_, InFlightTransfer> (in-flight journal)
//!     ├── Arc<Semaphore>                    (worker pool permits)
//!     └── TaskTracker                       (worker pool tasks)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{AccountLocks, BalanceCache, Ledger, PersistenceQueue, TransactionStorage};
use crate::metrics::Metrics;
use crate::notify::{Notice, Notifier, Recipient, TracingNotifier};
use crate::settings::{Settings, SettingsHandle};
use crate::types::{
    AccountId, LedgerError, StorageError, Transaction, TransactionErrorKind, TransactionId,
    TransactionResult, TransactionStats,
};

/// How far an unfinished transfer got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightStage {
    /// About to debit the sender
    Debiting,
    /// Sender debited, receiver not yet credited
    Debited,
    /// The compensating re-credit failed; balances need manual reconciliation
    RollbackFailed,
}

/// Journal entry for a transfer that has not completed
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightTransfer {
    /// The transfer, tax included
    pub transaction: Transaction,
    pub stage: InFlightStage,
    pub updated_at: DateTime<Utc>,
}

/// Shared state of one engine, owned jointly by the manager and its workers
struct EngineCore {
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn TransactionStorage>,
    cache: Arc<BalanceCache>,
    queue: Arc<PersistenceQueue>,
    locks: Arc<AccountLocks>,
    journal: DashMap<TransactionId, InFlightTransfer>,
    settings: SettingsHandle,
    metrics: Metrics,
    notifier: Arc<dyn Notifier>,
    span: tracing::Span,
}

impl EngineCore {
    fn journal_stage(&self, transaction: &Transaction, stage: InFlightStage) {
        self.journal.insert(
            transaction.id,
            InFlightTransfer {
                transaction: transaction.clone(),
                stage,
                updated_at: Utc::now(),
            },
        );
    }

    /// `amount + tax` does not fit in a decimal; nothing is touched
    fn overflowed(&self, transaction: &Transaction) -> TransactionErrorKind {
        tracing::warn!(
            parent: &self.span,
            transaction = %transaction.id,
            amount = %transaction.amount,
            "Transfer total overflows"
        );
        TransactionErrorKind::TransactionFailed {
            transaction: transaction.id,
        }
    }

    /// Run one transfer to completion on the current task
    async fn execute(&self, transaction: Transaction, settings: &Settings) -> TransactionResult {
        let Some(tax) = settings.tax.tax_for(transaction.amount) else {
            return Err(self.overflowed(&transaction));
        };
        let transaction = transaction.with_tax(tax);
        let Some(total) = transaction.total_debit() else {
            return Err(self.overflowed(&transaction));
        };
        let currency = transaction.currency.as_str();

        let parties: Vec<AccountId> = transaction
            .sender
            .into_iter()
            .chain(std::iter::once(transaction.receiver))
            .collect();
        let _guard = self.locks.acquire(&parties).await;

        if let Some(sender) = transaction.sender {
            let available = match self.cache.get_balance(sender, currency).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(
                        parent: &self.span,
                        transaction = %transaction.id,
                        error = %e,
                        "Failed to read sender balance"
                    );
                    return Err(TransactionErrorKind::TransactionFailed {
                        transaction: transaction.id,
                    });
                }
            };
            if available < total {
                return Err(TransactionErrorKind::InsufficientFunds {
                    available,
                    required: total,
                });
            }

            self.journal_stage(&transaction, InFlightStage::Debiting);
            let debit = self.ledger.remove_balance(sender, currency, total).await;
            self.cache.invalidate(sender, currency);
            if let Err(e) = debit {
                self.journal.remove(&transaction.id);
                tracing::warn!(
                    parent: &self.span,
                    transaction = %transaction.id,
                    error = %e,
                    "Debit failed, nothing to roll back"
                );
                return Err(TransactionErrorKind::TransactionFailed {
                    transaction: transaction.id,
                });
            }
            self.journal_stage(&transaction, InFlightStage::Debited);
        }

        let credit = self
            .ledger
            .add_balance(transaction.receiver, currency, transaction.amount)
            .await;
        self.cache.invalidate(transaction.receiver, currency);
        if let Err(e) = credit {
            return Err(self.roll_back(&transaction, total, e).await);
        }

        self.journal.remove(&transaction.id);
        if settings.logging.console {
            tracing::info!(
                parent: &self.span,
                transaction = %transaction.id,
                sender = %transaction.sender_or_sentinel(),
                receiver = %transaction.receiver,
                currency,
                amount = %transaction.amount,
                tax = %tax,
                "Transfer completed"
            );
        }
        self.persist(&transaction, settings).await;
        Ok(transaction)
    }

    /// Compensate a failed credit by returning the debited total to the sender
    async fn roll_back(
        &self,
        transaction: &Transaction,
        total: Decimal,
        cause: LedgerError,
    ) -> TransactionErrorKind {
        let failed = TransactionErrorKind::TransactionFailed {
            transaction: transaction.id,
        };

        let Some(sender) = transaction.sender else {
            // system transfers debit nobody
            self.journal.remove(&transaction.id);
            tracing::warn!(
                parent: &self.span,
                transaction = %transaction.id,
                error = %cause,
                "Credit failed for system transfer"
            );
            return failed;
        };

        let currency = transaction.currency.as_str();
        let refund = self
            .ledger
            .add_balance(sender, currency, total)
            .await;
        self.cache.invalidate(sender, currency);

        match refund {
            Ok(()) => {
                self.journal.remove(&transaction.id);
                tracing::warn!(
                    parent: &self.span,
                    transaction = %transaction.id,
                    error = %cause,
                    "Credit failed, sender refunded"
                );
            }
            Err(e) => {
                self.journal_stage(transaction, InFlightStage::RollbackFailed);
                self.metrics.record_rollback_failure();
                let detail = format!(
                    "credit of {} {} to {} failed ({}); refund of {} to {} failed ({})",
                    transaction.amount,
                    currency,
                    transaction.receiver,
                    cause,
                    total,
                    sender,
                    e
                );
                tracing::error!(
                    parent: &self.span,
                    transaction = %transaction.id,
                    detail = %detail,
                    "CRITICAL: rollback failed, manual reconciliation required"
                );
                self.notifier.notify(
                    Recipient::Operators,
                    Notice::CriticalRollbackFailure {
                        transaction: transaction.id,
                        detail,
                    },
                );
            }
        }
        failed
    }

    async fn persist(&self, transaction: &Transaction, settings: &Settings) {
        if !settings.persistence.save_history {
            return;
        }
        if settings.persistence.batch_writes {
            self.queue.enqueue(transaction.clone());
            return;
        }
        if let Err(e) = self.storage.save_one(transaction).await {
            self.metrics.record_storage_failure();
            tracing::warn!(
                parent: &self.span,
                transaction = %transaction.id,
                error = %e,
                "Failed to save transaction, queued for retry"
            );
            self.queue.enqueue(transaction.clone());
        }
    }
}

/// Transfer executor with a bounded worker pool
///
/// Must be built inside a Tokio runtime: building starts the persistence
/// flusher and the balance cache sweeper, and [`Self::shutdown`] stops them.
pub struct TransactionManager {
    core: Arc<EngineCore>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,

    /// Cancels workers still running once the shutdown grace period is over
    abort: CancellationToken,

    /// Stops the flusher and the sweeper
    background: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("in_flight", &self.core.journal.len())
            .field("queued", &self.core.queue.len())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

/// Builder for [`TransactionManager`]
pub struct TransactionManagerBuilder {
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn TransactionStorage>,
    metrics: Metrics,
    settings: SettingsHandle,
    notifier: Arc<dyn Notifier>,
    span: tracing::Span,
}

impl TransactionManagerBuilder {
    pub fn settings(mut self, settings: SettingsHandle) -> Self {
        self.settings = settings;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Span every engine event is emitted under
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Build the manager and start its background tasks
    pub fn build(self) -> TransactionManager {
        let snapshot = self.settings.current();

        let cache = Arc::new(
            BalanceCache::new(
                Arc::clone(&self.ledger),
                self.settings.clone(),
                self.metrics.clone(),
            )
            .with_span(self.span.clone()),
        );
        let queue = Arc::new(
            PersistenceQueue::new(
                Arc::clone(&self.storage),
                self.settings.clone(),
                self.metrics.clone(),
            )
            .with_span(self.span.clone()),
        );

        let locks = Arc::new(AccountLocks::new());

        let background = CancellationToken::new();
        let mut handles = vec![
            queue.spawn_flusher(background.child_token()),
            locks.spawn_pruner(
                snapshot.cache.cleanup_interval(),
                background.child_token(),
                self.span.clone(),
            ),
        ];
        if snapshot.cache.balance_enabled {
            handles.push(cache.spawn_sweeper(background.child_token()));
        }

        TransactionManager {
            core: Arc::new(EngineCore {
                ledger: self.ledger,
                storage: self.storage,
                cache,
                queue,
                locks,
                journal: DashMap::new(),
                settings: self.settings,
                metrics: self.metrics,
                notifier: self.notifier,
                span: self.span,
            }),
            workers: Arc::new(Semaphore::new(snapshot.engine.worker_threads.max(1))),
            tracker: TaskTracker::new(),
            abort: CancellationToken::new(),
            background,
            handles: Mutex::new(handles),
        }
    }
}

impl TransactionManager {
    /// Start building a manager with default settings and a logging notifier
    pub fn builder(
        ledger: Arc<dyn Ledger>,
        storage: Arc<dyn TransactionStorage>,
        metrics: Metrics,
    ) -> TransactionManagerBuilder {
        TransactionManagerBuilder {
            ledger,
            storage,
            metrics,
            settings: SettingsHandle::default(),
            notifier: Arc::new(TracingNotifier),
            span: tracing::Span::none(),
        }
    }

    /// Execute one transfer
    ///
    /// # Arguments
    ///
    /// * `sender` - Paying account, `None` for a system disbursement
    /// * `receiver` - Credited account
    /// * `currency` - Currency code known to the ledger
    /// * `amount` - Amount credited to the receiver, already validated by the caller
    /// * `allow_async` - Run on the worker pool when async operations are enabled
    ///
    /// # Returns
    ///
    /// * `Ok(transaction)` - The completed transfer with its tax attached
    /// * `Err(InsufficientFunds)` - Sender holds less than `amount + tax`; nothing changed
    /// * `Err(TransactionFailed)` - A ledger call failed and one rollback was attempted
    /// * `Err(UnknownError)` - The worker died or the engine is shut down
    pub async fn process_transaction(
        &self,
        sender: Option<AccountId>,
        receiver: AccountId,
        currency: &str,
        amount: Decimal,
        allow_async: bool,
    ) -> TransactionResult {
        let started = std::time::Instant::now();
        let settings = self.core.settings.current();
        let transaction = Transaction::new(sender, receiver, currency, amount);

        let result = if allow_async && settings.engine.async_operations {
            self.execute_on_pool(transaction, settings).await
        } else {
            self.core.execute(transaction, &settings).await
        };

        self.core
            .metrics
            .record_transaction(result.is_ok(), started.elapsed());
        result
    }

    async fn execute_on_pool(
        &self,
        transaction: Transaction,
        settings: Arc<Settings>,
    ) -> TransactionResult {
        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
            tracing::warn!(
                parent: &self.core.span,
                transaction = %transaction.id,
                "Engine is shut down, transfer rejected"
            );
            return Err(TransactionErrorKind::UnknownError);
        };

        let core = Arc::clone(&self.core);
        let abort = self.abort.clone();
        let id = transaction.id;
        let handle = self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                result = core.execute(transaction, &settings) => result,
                _ = abort.cancelled() => Err(TransactionErrorKind::UnknownError),
            }
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    parent: &self.core.span,
                    transaction = %id,
                    error = %e,
                    "Transfer worker failed"
                );
                Err(TransactionErrorKind::UnknownError)
            }
        }
    }

    /// Stop accepting work, drain the pool and flush pending history
    ///
    /// Workers get `shutdown_grace_secs` to finish. Anything still running
    /// after that is cancelled and stays in the in-flight journal at the stage
    /// it reached. History is written last so transfers completed during the
    /// grace period are included in the final flush.
    pub async fn shutdown(&self) {
        let grace = self.core.settings.current().engine.shutdown_grace();

        self.background.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.workers.close();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                parent: &self.core.span,
                remaining = self.tracker.len(),
                "Shutdown grace period elapsed, cancelling transfers"
            );
            self.abort.cancel();
            self.tracker.wait().await;
        }

        match self.core.queue.flush_all().await {
            Ok(written) => {
                tracing::info!(parent: &self.core.span, written, "Final history flush complete")
            }
            Err(e) => tracing::error!(
                parent: &self.core.span,
                pending = self.core.queue.len(),
                error = %e,
                "Final history flush failed"
            ),
        }
    }

    /// Newest-first history of `account`
    pub async fn transaction_history(
        &self,
        account: AccountId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        self.core.storage.history(account, limit).await
    }

    pub async fn transaction_history_since(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        self.core.storage.history_since(account, since, limit).await
    }

    pub async fn transaction_stats(
        &self,
        account: AccountId,
    ) -> Result<TransactionStats, StorageError> {
        self.core.storage.stats(account).await
    }

    /// Transfers that have not completed, oldest first
    pub fn in_flight(&self) -> Vec<InFlightTransfer> {
        let mut entries: Vec<_> = self
            .core
            .journal
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.transaction.timestamp);
        entries
    }

    /// Drop a journal entry once an operator has reconciled it
    pub fn resolve_in_flight(&self, id: TransactionId) -> Option<InFlightTransfer> {
        let (_, entry) = self.core.journal.remove(&id)?;
        tracing::info!(
            parent: &self.core.span,
            transaction = %id,
            stage = ?entry.stage,
            "In-flight transfer resolved"
        );
        Some(entry)
    }

    pub fn cache(&self) -> &BalanceCache {
        &self.core.cache
    }

    pub fn queue(&self) -> &PersistenceQueue {
        &self.core.queue
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.core.ledger
    }

    pub fn storage(&self) -> &Arc<dyn TransactionStorage> {
        &self.core.storage
    }

    pub fn metrics(&self) -> &Metrics {
        &self.core.metrics
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.core.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLedger, InMemoryStorage, LedgerOp};
    use crate::notify::RecordingNotifier;
    use rstest::rstest;
    use uuid::Uuid;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        storage: Arc<InMemoryStorage>,
        notifier: Arc<RecordingNotifier>,
        manager: TransactionManager,
    }

    fn fixture(settings: Settings) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::with_currencies(["tokens"]));
        let storage = Arc::new(InMemoryStorage::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = TransactionManager::builder(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Arc::clone(&storage) as Arc<dyn TransactionStorage>,
            Metrics::new().unwrap(),
        )
        .settings(SettingsHandle::new(settings))
        .notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .build();
        Fixture {
            ledger,
            storage,
            notifier,
            manager,
        }
    }

    fn taxed(percentage: i64, fixed: i64, minimum: i64) -> Settings {
        let mut settings = Settings::default();
        settings.tax.enabled = true;
        settings.tax.percentage = Decimal::new(percentage, 0);
        settings.tax.fixed = Decimal::new(fixed, 0);
        settings.tax.minimum_for_tax = Decimal::new(minimum, 0);
        settings
    }

    #[rstest]
    #[case::inline(false)]
    #[case::pooled(true)]
    #[tokio::test]
    async fn test_successful_transfer_conserves_money(#[case] allow_async: bool) {
        let f = fixture(Settings::default());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(100, 0));

        let transaction = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(30, 0), allow_async)
            .await
            .unwrap();

        assert_eq!(transaction.tax(), Decimal::ZERO);
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::new(70, 0));
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::new(30, 0));
        assert_eq!(f.ledger.total_supply("tokens"), Decimal::new(100, 0));
        assert!(f.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_tax_is_debited_but_not_credited() {
        let f = fixture(taxed(10, 0, 0));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(100, 0));

        let transaction = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(50, 0), false)
            .await
            .unwrap();

        assert_eq!(transaction.tax(), Decimal::new(5, 0));
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::new(45, 0));
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::new(50, 0));
    }

    #[tokio::test]
    async fn test_insufficient_funds_changes_nothing() {
        let f = fixture(taxed(10, 0, 0));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(54, 0));

        let result = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(50, 0), false)
            .await;

        assert_eq!(
            result,
            Err(TransactionErrorKind::InsufficientFunds {
                available: Decimal::new(54, 0),
                required: Decimal::new(55, 0),
            })
        );
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::new(54, 0));
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::ZERO);
        assert_eq!(f.manager.metrics().snapshot().transactions_failed, 1);
    }

    #[tokio::test]
    async fn test_overflowing_total_fails_without_touching_balances() {
        let f = fixture(taxed(10, 0, 0));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::MAX);

        let result = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::MAX, false)
            .await;

        assert!(matches!(result, Err(TransactionErrorKind::TransactionFailed { .. })));
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::MAX);
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::ZERO);
        assert!(f.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_system_transfer_mints_without_debit() {
        let f = fixture(Settings::default());
        let bob = Uuid::new_v4();

        let transaction = f
            .manager
            .process_transaction(None, bob, "tokens", Decimal::new(500, 0), false)
            .await
            .unwrap();

        assert!(transaction.is_system());
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::new(500, 0));
    }

    #[tokio::test]
    async fn test_failed_credit_refunds_sender() {
        let f = fixture(Settings::default());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(100, 0));
        f.ledger.fail_next(LedgerOp::Add, bob, 1);

        let result = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(40, 0), false)
            .await;

        assert!(matches!(
            result,
            Err(TransactionErrorKind::TransactionFailed { .. })
        ));
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::new(100, 0));
        assert_eq!(f.ledger.peek(bob, "tokens"), Decimal::ZERO);
        assert!(f.manager.in_flight().is_empty());
        assert!(f.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_alerts_operators_and_stays_in_journal() {
        let f = fixture(Settings::default());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(100, 0));
        f.ledger.fail_next(LedgerOp::Add, bob, 1);
        f.ledger.fail_next(LedgerOp::Add, alice, 1);

        let result = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(40, 0), false)
            .await;

        let Err(TransactionErrorKind::TransactionFailed { transaction }) = result else {
            panic!("expected TransactionFailed, got {result:?}");
        };
        let alerts = f.notifier.notices_for(Recipient::Operators);
        assert!(matches!(
            alerts.as_slice(),
            [Notice::CriticalRollbackFailure { transaction: id, .. }] if *id == transaction
        ));
        assert_eq!(f.manager.metrics().snapshot().rollback_failures, 1);

        let in_flight = f.manager.in_flight();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].stage, InFlightStage::RollbackFailed);

        assert!(f.manager.resolve_in_flight(transaction).is_some());
        assert!(f.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_failed_debit_leaves_no_journal_entry() {
        let f = fixture(Settings::default());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(100, 0));
        f.ledger.fail_next(LedgerOp::Remove, alice, 1);

        let result = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(40, 0), false)
            .await;

        assert!(matches!(
            result,
            Err(TransactionErrorKind::TransactionFailed { .. })
        ));
        assert_eq!(f.ledger.total_supply("tokens"), Decimal::new(100, 0));
        assert!(f.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_persistence_when_batching_disabled() {
        let mut settings = Settings::default();
        settings.persistence.batch_writes = false;
        let f = fixture(settings);
        let bob = Uuid::new_v4();

        let transaction = f
            .manager
            .process_transaction(None, bob, "tokens", Decimal::ONE, false)
            .await
            .unwrap();

        assert!(f.storage.contains(transaction.id));
        assert!(f.manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_history_disabled_persists_nothing() {
        let mut settings = Settings::default();
        settings.persistence.save_history = false;
        let f = fixture(settings);

        f.manager
            .process_transaction(None, Uuid::new_v4(), "tokens", Decimal::ONE, false)
            .await
            .unwrap();
        f.manager.shutdown().await;

        assert!(f.storage.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue_and_rejects_new_work() {
        let f = fixture(Settings::default());
        let bob = Uuid::new_v4();
        for _ in 0..5 {
            f.manager
                .process_transaction(None, bob, "tokens", Decimal::ONE, true)
                .await
                .unwrap();
        }
        assert_eq!(f.manager.queue().len(), 5);

        f.manager.shutdown().await;

        assert_eq!(f.storage.len(), 5);
        assert_eq!(f.manager.transaction_history(bob, 10).await.unwrap().len(), 5);
        assert_eq!(
            f.manager
                .process_transaction(None, bob, "tokens", Decimal::ONE, true)
                .await,
            Err(TransactionErrorKind::UnknownError)
        );
    }

    #[tokio::test]
    async fn test_tax_change_applies_to_later_transfers_only() {
        let f = fixture(Settings::default());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.ledger.set_balance(alice, "tokens", Decimal::new(1_000, 0));

        let before = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(100, 0), false)
            .await
            .unwrap();
        f.manager.settings().replace(taxed(0, 3, 0));
        let after = f
            .manager
            .process_transaction(Some(alice), bob, "tokens", Decimal::new(100, 0), false)
            .await
            .unwrap();

        assert_eq!(before.tax(), Decimal::ZERO);
        assert_eq!(after.tax(), Decimal::new(3, 0));
        assert_eq!(f.ledger.peek(alice, "tokens"), Decimal::new(797, 0));
    }
}
