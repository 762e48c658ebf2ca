//! CSV-driven replay of transfers
//!
//! Seeds an [`InMemoryLedger`] from a balance file, feeds every row of a
//! transfer file through a [`PaymentService`] and writes the final balances
//! (and optionally the persisted history) as CSV.
//!
//! Row-level failures never stop a replay. Unreadable rows and rejected
//! transfers are logged with their line number and counted in the
//! [`ReplaySummary`]; only I/O problems on the files themselves are fatal.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::TransactionManager;
use crate::io::{read_balances, write_balances_csv, write_history_csv, ReplayAction, SyncReader};
use crate::memory::{InMemoryLedger, InMemoryStorage};
use crate::metrics::Metrics;
use crate::notify::TracingNotifier;
use crate::service::{PaymentOutcome, PaymentRequest, PaymentService};
use crate::settings::{Settings, SettingsHandle};
use crate::types::{AccountId, CurrencyCode, Privileges};

/// Fatal replay failures
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Where a replay reads from and writes to
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub transfers: PathBuf,
    pub balances: Option<PathBuf>,
    pub history: Option<PathBuf>,
}

/// Row outcomes of one replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Transfers executed by the engine
    pub completed: usize,
    /// Transfers parked for confirmation and never confirmed in the file
    pub parked: usize,
    /// Transfers (or confirm/cancel requests) refused by a gate or the engine
    pub rejected: usize,
    /// Rows that could not be read or converted
    pub invalid_rows: usize,
}

/// A payment service over in-memory collaborators
pub struct Replay {
    service: PaymentService,
    ledger: Arc<InMemoryLedger>,
    storage: Arc<InMemoryStorage>,
    cancel: CancellationToken,
    summary: ReplaySummary,
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("service", &self.service)
            .field("summary", &self.summary)
            .finish()
    }
}

impl Replay {
    /// Build the engine and service; must be called inside a Tokio runtime
    pub fn new(settings: Settings, cancel: CancellationToken) -> Result<Self, ReplayError> {
        let ledger = Arc::new(InMemoryLedger::new());
        let storage = Arc::new(InMemoryStorage::new());
        let span = tracing::info_span!("replay");

        let engine = TransactionManager::builder(
            Arc::clone(&ledger) as _,
            Arc::clone(&storage) as _,
            Metrics::new()?,
        )
        .settings(SettingsHandle::new(settings))
        .span(span.clone())
        .build();
        let service = PaymentService::with_span(Arc::new(engine), Arc::new(TracingNotifier), span);

        Ok(Self {
            service,
            ledger,
            storage,
            cancel,
            summary: ReplaySummary::default(),
        })
    }

    /// Set the seed balances; every seeded currency becomes known
    pub fn seed(&self, balances: &[(AccountId, CurrencyCode, Decimal)]) {
        for (account, currency, balance) in balances {
            self.ledger.set_balance(*account, currency, *balance);
        }
        tracing::info!(rows = balances.len(), "Ledger seeded");
    }

    fn known_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .ledger
            .snapshot()
            .into_iter()
            .map(|(account, _, _)| account)
            .collect();
        accounts.dedup();
        accounts
    }

    /// Run one action through the service, counting its outcome
    pub async fn apply(&mut self, line: usize, action: ReplayAction) {
        let cancel = self.cancel.clone();
        let result = match action {
            ReplayAction::Pay {
                sender,
                receiver,
                currency,
                amount,
            } => {
                let request = PaymentRequest::new(sender, receiver, currency, amount);
                self.service.pay(request, &cancel).await.map(|outcome| match outcome {
                    PaymentOutcome::Completed(_) => self.summary.completed += 1,
                    PaymentOutcome::ConfirmationRequired(pending) => {
                        tracing::info!(
                            line,
                            sender = %pending.sender,
                            amount = %pending.amount,
                            "Transfer parked for confirmation"
                        );
                        self.summary.parked += 1;
                    }
                })
            }
            ReplayAction::Confirm { sender } => self
                .service
                .confirm(sender, Privileges::default(), &cancel)
                .await
                .map(|_| {
                    self.summary.parked = self.summary.parked.saturating_sub(1);
                    self.summary.completed += 1;
                }),
            ReplayAction::Cancel { sender } => self
                .service
                .cancel_pending(sender)
                .map(|()| self.summary.parked = self.summary.parked.saturating_sub(1)),
            ReplayAction::PayAll {
                sender,
                currency,
                amount,
            } => {
                let recipients = self.known_accounts();
                self.service
                    .pay_all(
                        sender,
                        Privileges::default(),
                        &recipients,
                        &currency,
                        &amount,
                        &cancel,
                    )
                    .await
                    .map(|report| {
                        for (receiver, kind) in &report.failed {
                            tracing::warn!(
                                line,
                                receiver = %receiver,
                                reason = kind.key(),
                                "Pay-all transfer failed"
                            );
                        }
                        self.summary.completed += report.succeeded.len();
                        self.summary.rejected += report.failed.len();
                    })
            }
        };

        if let Err(error) = result {
            tracing::warn!(line, reason = error.key(), error = %error, "Row rejected");
            self.summary.rejected += 1;
        }
    }

    /// Count a row that never became an action
    pub fn skip(&mut self, error: &str) {
        tracing::warn!(error, "Skipping unreadable row");
        self.summary.invalid_rows += 1;
    }

    pub fn service(&self) -> &PaymentService {
        &self.service
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    /// Shut the engine down, then write balances and history
    ///
    /// The history is read after the final flush, so it holds every
    /// completed transfer.
    pub async fn finish(
        self,
        balances: &mut dyn Write,
        history: Option<&mut dyn Write>,
    ) -> Result<ReplaySummary, ReplayError> {
        self.service.shutdown().await;

        let metrics = self.service.metrics();
        tracing::info!(
            completed = self.summary.completed,
            parked = self.summary.parked,
            rejected = self.summary.rejected,
            invalid_rows = self.summary.invalid_rows,
            success_rate = metrics.success_rate(),
            cache_hit_ratio = metrics.cache_hit_ratio(),
            batches = metrics.batch_operations,
            "Replay finished"
        );

        write_balances_csv(&self.ledger.snapshot(), balances).map_err(ReplayError::Output)?;
        if let Some(history) = history {
            write_history_csv(&self.storage.all(), history).map_err(ReplayError::Output)?;
        }
        Ok(self.summary)
    }
}

/// Replay `options.transfers` and write the final balances to `output`
///
/// Stops reading early when `cancel` fires; whatever was applied so far is
/// still flushed and written.
pub async fn run(
    settings: Settings,
    options: &ReplayOptions,
    output: &mut dyn Write,
    cancel: CancellationToken,
) -> Result<ReplaySummary, ReplayError> {
    let seed = match &options.balances {
        Some(path) => read_balances(path).map_err(ReplayError::Input)?,
        None => Vec::new(),
    };
    let reader = SyncReader::new(&options.transfers).map_err(ReplayError::Input)?;
    let mut history = match &options.history {
        Some(path) => Some(std::fs::File::create(path).map_err(|e| {
            ReplayError::Output(format!("Failed to create '{}': {}", path.display(), e))
        })?),
        None => None,
    };

    let mut replay = Replay::new(settings, cancel.clone())?;
    replay.seed(&seed);

    for (index, row) in reader.enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(line = index + 2, "Replay interrupted");
            break;
        }
        match row {
            Ok(action) => replay.apply(index + 2, action).await,
            Err(error) => replay.skip(&error),
        }
    }

    replay
        .finish(output, history.as_mut().map(|file| file as &mut dyn Write))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.cooldown.enabled = false;
        settings.logging.console = false;
        settings
    }

    #[tokio::test]
    async fn test_apply_counts_outcomes() {
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut replay = Replay::new(settings(), CancellationToken::new()).unwrap();
        replay.seed(&[(alice, "tokens".to_string(), Decimal::new(2_000_000, 0))]);

        let pay = |amount: &str| ReplayAction::Pay {
            sender: Some(alice),
            receiver: bob,
            currency: "tokens".to_string(),
            amount: amount.to_string(),
        };
        replay.apply(2, pay("100")).await;
        replay.apply(3, pay("1M")).await;
        replay.apply(4, ReplayAction::Confirm { sender: alice }).await;
        replay.apply(5, ReplayAction::Cancel { sender: alice }).await;
        replay.apply(6, pay("abc")).await;
        replay.skip("Line 7: Invalid action");

        let mut output = Vec::<u8>::new();
        let summary = replay.finish(&mut output, None).await.unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                completed: 2,
                parked: 0,
                rejected: 2,
                invalid_rows: 1,
            }
        );
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains(&format!("{bob},tokens,1000100")));
    }

    #[tokio::test]
    async fn test_pay_all_reaches_every_seeded_account() {
        let accounts: Vec<AccountId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut replay = Replay::new(settings(), CancellationToken::new()).unwrap();
        let seed: Vec<_> = accounts
            .iter()
            .map(|account| (*account, "tokens".to_string(), Decimal::new(100, 0)))
            .collect();
        replay.seed(&seed);

        replay
            .apply(
                2,
                ReplayAction::PayAll {
                    sender: accounts[0],
                    currency: "tokens".to_string(),
                    amount: "10".to_string(),
                },
            )
            .await;

        assert_eq!(replay.ledger().peek(accounts[0], "tokens"), Decimal::new(70, 0));
        for account in &accounts[1..] {
            assert_eq!(replay.ledger().peek(*account, "tokens"), Decimal::new(110, 0));
        }
        let mut output = Vec::<u8>::new();
        let summary = replay.finish(&mut output, None).await.unwrap();
        assert_eq!(summary.completed, 3);
    }

    #[tokio::test]
    async fn test_cancelled_replay_rejects_rows() {
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let cancel = CancellationToken::new();
        let mut replay = Replay::new(settings(), cancel.clone()).unwrap();
        replay.seed(&[(alice, "tokens".to_string(), Decimal::new(100, 0))]);
        cancel.cancel();

        replay
            .apply(
                2,
                ReplayAction::Pay {
                    sender: Some(alice),
                    receiver: bob,
                    currency: "tokens".to_string(),
                    amount: "5".to_string(),
                },
            )
            .await;

        assert_eq!(replay.ledger().peek(alice, "tokens"), Decimal::new(100, 0));
        let summary = replay.finish(&mut Vec::<u8>::new(), None).await.unwrap();
        assert_eq!(summary.rejected, 1);
    }
}
