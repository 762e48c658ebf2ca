//! Pipeline integration tests
//!
//! Drive the payment service and the engine together over the in-memory
//! collaborators, checking money conservation and the caller-visible
//! outcome of taxed, concurrent and shut-down transfers.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_transfer_engine::core::{Ledger, TransactionManager, TransactionStorage};
use rust_transfer_engine::memory::{InMemoryLedger, InMemoryStorage};
use rust_transfer_engine::metrics::Metrics;
use rust_transfer_engine::notify::{Notifier, RecordingNotifier};
use rust_transfer_engine::service::{PaymentOutcome, PaymentRequest, PaymentService};
use rust_transfer_engine::settings::{Settings, SettingsHandle};
use rust_transfer_engine::types::{AccountId, LedgerError, TransactionErrorKind, TransferError};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    ledger: Arc<InMemoryLedger>,
    storage: Arc<InMemoryStorage>,
    service: PaymentService,
}

/// Ledger whose next balance read, once armed, stalls after reading
struct StallingLedger {
    inner: Arc<InMemoryLedger>,
    stall: parking_lot::Mutex<Option<oneshot::Receiver<()>>>,
    stalled: Notify,
}

impl StallingLedger {
    fn arm(&self) -> oneshot::Sender<()> {
        let (release, stall) = oneshot::channel();
        *self.stall.lock() = Some(stall);
        release
    }
}

#[async_trait]
impl Ledger for StallingLedger {
    async fn currency_exists(&self, currency: &str) -> Result<bool, LedgerError> {
        self.inner.currency_exists(currency).await
    }

    async fn balance(&self, account: AccountId, currency: &str) -> Result<Decimal, LedgerError> {
        let value = self.inner.balance(account, currency).await?;
        let stall = self.stall.lock().take();
        if let Some(release) = stall {
            self.stalled.notify_one();
            let _ = release.await;
        }
        Ok(value)
    }

    async fn add_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError> {
        self.inner.add_balance(account, currency, delta).await
    }

    async fn remove_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError> {
        self.inner.remove_balance(account, currency, delta).await
    }
}

fn harness(settings: Settings) -> Harness {
    let ledger = Arc::new(InMemoryLedger::with_currencies(["tokens"]));
    harness_over(Arc::clone(&ledger), ledger as Arc<dyn Ledger>, settings)
}

fn harness_over(
    ledger: Arc<InMemoryLedger>,
    backend: Arc<dyn Ledger>,
    settings: Settings,
) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
    let engine = TransactionManager::builder(
        backend,
        Arc::clone(&storage) as Arc<dyn TransactionStorage>,
        Metrics::new().unwrap(),
    )
    .settings(SettingsHandle::new(settings))
    .notifier(Arc::clone(&notifier))
    .build();
    Harness {
        ledger,
        storage,
        service: PaymentService::new(Arc::new(engine), notifier),
    }
}

fn quiet() -> Settings {
    let mut settings = Settings::default();
    settings.cooldown.enabled = false;
    settings.rate_limit.enabled = false;
    settings.logging.console = false;
    settings
}

fn ten_percent_tax() -> Settings {
    let mut settings = quiet();
    settings.tax.enabled = true;
    settings.tax.percentage = Decimal::new(10, 0);
    settings.tax.fixed = Decimal::ZERO;
    settings
}

async fn pay(
    harness: &Harness,
    sender: AccountId,
    receiver: AccountId,
    amount: &str,
) -> Result<PaymentOutcome, TransferError> {
    harness
        .service
        .pay(
            PaymentRequest::new(Some(sender), receiver, "tokens", amount),
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_taxed_transfer_needs_amount_plus_tax() {
    let harness = harness(ten_percent_tax());
    let (sender, receiver) = (Uuid::new_v4(), Uuid::new_v4());

    harness.ledger.set_balance(sender, "tokens", Decimal::new(100, 0));
    let outcome = pay(&harness, sender, receiver, "50").await.unwrap();
    let PaymentOutcome::Completed(transaction) = outcome else {
        panic!("expected a completed transfer, got {:?}", outcome);
    };
    assert_eq!(transaction.tax(), Decimal::new(5, 0));
    assert_eq!(harness.ledger.peek(sender, "tokens"), Decimal::new(45, 0));
    assert_eq!(harness.ledger.peek(receiver, "tokens"), Decimal::new(50, 0));

    // 54 available, 55 required
    harness.ledger.set_balance(sender, "tokens", Decimal::new(54, 0));
    harness.service.engine().cache().invalidate(sender, "tokens");
    let error = pay(&harness, sender, receiver, "50").await.unwrap_err();
    assert_eq!(error.key(), "insufficient_funds");
    assert_eq!(harness.ledger.peek(sender, "tokens"), Decimal::new(54, 0));

    // exactly 55 available
    harness.ledger.set_balance(sender, "tokens", Decimal::new(55, 0));
    harness.service.engine().cache().invalidate(sender, "tokens");
    pay(&harness, sender, receiver, "50").await.unwrap();
    assert_eq!(harness.ledger.peek(sender, "tokens"), Decimal::ZERO);
    assert_eq!(harness.ledger.peek(receiver, "tokens"), Decimal::new(100, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_from_one_account_never_overdraw() {
    let harness = Arc::new(harness(quiet()));
    let sender = Uuid::new_v4();
    let receivers: Vec<AccountId> = (0..20).map(|_| Uuid::new_v4()).collect();
    harness.ledger.set_balance(sender, "tokens", Decimal::new(100, 0));

    let tasks: Vec<_> = receivers
        .iter()
        .map(|receiver| {
            let harness = Arc::clone(&harness);
            let receiver = *receiver;
            tokio::spawn(async move {
                harness
                    .service
                    .engine()
                    .process_transaction(Some(sender), receiver, "tokens", Decimal::new(10, 0), true)
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(kind) => assert!(
                matches!(kind, TransactionErrorKind::InsufficientFunds { .. }),
                "unexpected failure {:?}",
                kind
            ),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(harness.ledger.peek(sender, "tokens"), Decimal::ZERO);
    assert_eq!(harness.ledger.total_supply("tokens"), Decimal::new(100, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock() {
    let harness = Arc::new(harness(quiet()));
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    harness.ledger.set_balance(a, "tokens", Decimal::new(1_000, 0));
    harness.ledger.set_balance(b, "tokens", Decimal::new(1_000, 0));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let harness = Arc::clone(&harness);
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            tokio::spawn(async move {
                harness
                    .service
                    .engine()
                    .process_transaction(Some(from), to, "tokens", Decimal::ONE, true)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.ledger.peek(a, "tokens"), Decimal::new(1_000, 0));
    assert_eq!(harness.ledger.peek(b, "tokens"), Decimal::new(1_000, 0));
}

#[tokio::test]
async fn test_shutdown_persists_every_completed_transfer() {
    let mut settings = quiet();
    settings.persistence.batch_size = 3;
    let harness = harness(settings);
    let sender = Uuid::new_v4();
    harness.ledger.set_balance(sender, "tokens", Decimal::new(1_000, 0));

    for _ in 0..7 {
        pay(&harness, sender, Uuid::new_v4(), "10").await.unwrap();
    }
    harness.service.shutdown().await;

    assert_eq!(harness.storage.len(), 7);
    assert!(harness.service.engine().queue().is_empty());
    let error = pay(&harness, sender, Uuid::new_v4(), "10").await.unwrap_err();
    assert_eq!(error.key(), "unknown_error");
}

#[tokio::test]
async fn test_stale_pre_check_read_does_not_reach_the_engine() {
    let inner = Arc::new(InMemoryLedger::with_currencies(["tokens"]));
    let stalling = Arc::new(StallingLedger {
        inner: Arc::clone(&inner),
        stall: parking_lot::Mutex::new(None),
        stalled: Notify::new(),
    });
    let harness = Arc::new(harness_over(
        Arc::clone(&inner),
        Arc::clone(&stalling) as Arc<dyn Ledger>,
        quiet(),
    ));
    let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    inner.set_balance(alice, "tokens", Decimal::new(10, 0));

    // the funds pre-check of this payment reads 10, then stalls
    let release = stalling.arm();
    let stalled_pay = tokio::spawn({
        let harness = Arc::clone(&harness);
        async move { pay(&harness, alice, bob, "10").await }
    });
    stalling.stalled.notified().await;

    // meanwhile another transfer drains alice under the account lock
    harness
        .service
        .engine()
        .process_transaction(Some(alice), carol, "tokens", Decimal::new(10, 0), false)
        .await
        .unwrap();
    release.send(()).unwrap();

    let error = stalled_pay.await.unwrap().unwrap_err();
    assert_eq!(error.key(), "insufficient_funds");
    let error = pay(&harness, alice, bob, "10").await.unwrap_err();
    assert_eq!(error.key(), "insufficient_funds");
    assert_eq!(inner.peek(alice, "tokens"), Decimal::ZERO);
    assert_eq!(inner.peek(bob, "tokens"), Decimal::ZERO);
    assert_eq!(inner.peek(carol, "tokens"), Decimal::new(10, 0));
}
