//! Caller-side payment flow
//!
//! [`PaymentService`] is what a command handler talks to. It runs the
//! admission gates in a fixed order, parks large transfers for confirmation,
//! calls the [`TransactionManager`] and applies the completion side effects
//! (cooldown, rate-limit record, notifications).
//!
//! # Gate order
//!
//! 1. Self-transfer check
//! 2. Currency policy (exists, not blocked, allowed)
//! 3. Amount parsing and bounds
//! 4. Cooldown, then rate limit
//! 5. Balance pre-check including tax
//! 6. Confirmation threshold
//!
//! Cooldowns and rate-limit records are only applied after a successful
//! transfer; a failed transfer costs the sender nothing.
//!
//! # Cancellation
//!
//! Every entry point takes a [`CancellationToken`], checked before the gates
//! and again right before the engine call. Once the engine call has started
//! the transfer runs to completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::amount::AmountParser;
use crate::core::TransactionManager;
use crate::currency::CurrencyPolicy;
use crate::gates::{spawn_gate_sweeper, ConfirmationManager, CooldownManager, RateLimitManager};
use crate::metrics::MetricsSnapshot;
use crate::notify::{Notice, Notifier, Recipient};
use crate::settings::{Settings, SettingsHandle};
use crate::types::{
    AccountId, AmountError, PendingTransaction, Privileges, StorageError, Transaction,
    TransactionErrorKind, TransactionStats, TransferError,
};

/// Transfers of one pay-all run executed concurrently
const PAY_ALL_CHUNK: usize = 10;

/// Offline payments reported on join
const OFFLINE_HISTORY_LIMIT: usize = 50;

/// The amount plus tax (times recipients) does not fit in a decimal
fn too_large(amount: Decimal) -> TransferError {
    AmountError::AmountTooHigh {
        amount,
        maximum: Decimal::MAX,
    }
    .into()
}

/// A transfer as requested by a caller, amount still in user notation
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    /// `None` for the system actor
    pub sender: Option<AccountId>,
    pub receiver: AccountId,
    pub currency: String,
    pub amount: String,
    pub privileges: Privileges,
}

impl PaymentRequest {
    pub fn new(
        sender: Option<AccountId>,
        receiver: AccountId,
        currency: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        let privileges = if sender.is_none() {
            Privileges::system()
        } else {
            Privileges::default()
        };
        Self {
            sender,
            receiver,
            currency: currency.into(),
            amount: amount.into(),
            privileges,
        }
    }

    pub fn with_privileges(mut self, privileges: Privileges) -> Self {
        self.privileges = privileges;
        self
    }
}

/// What became of an admitted payment
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Completed(Transaction),
    /// Parked until the sender confirms it
    ConfirmationRequired(PendingTransaction),
}

/// Result of paying many recipients at once
#[derive(Debug, Clone, Default)]
pub struct PayAllReport {
    pub succeeded: Vec<Transaction>,
    pub failed: Vec<(AccountId, TransactionErrorKind)>,
    pub elapsed: Duration,
}

/// Gate sequence and completion side effects around the engine
pub struct PaymentService {
    engine: Arc<TransactionManager>,
    parser: AmountParser,
    currencies: CurrencyPolicy,
    cooldowns: Arc<CooldownManager>,
    rate_limits: Arc<RateLimitManager>,
    confirmations: ConfirmationManager,
    notifier: Arc<dyn Notifier>,
    settings: SettingsHandle,
    span: tracing::Span,

    /// Stops the gate sweeper
    background: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PaymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentService")
            .field("engine", &self.engine)
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

impl PaymentService {
    /// Build the gates around `engine`, sharing its settings and metrics
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(engine: Arc<TransactionManager>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_span(engine, notifier, tracing::Span::none())
    }

    pub fn with_span(
        engine: Arc<TransactionManager>,
        notifier: Arc<dyn Notifier>,
        span: tracing::Span,
    ) -> Self {
        let settings = engine.settings().clone();
        let metrics = engine.metrics().clone();
        let cooldowns = Arc::new(CooldownManager::new(settings.clone(), metrics.clone()));
        let rate_limits = Arc::new(RateLimitManager::new(settings.clone(), metrics));

        let background = CancellationToken::new();
        let sweeper = spawn_gate_sweeper(
            Arc::clone(&cooldowns),
            Arc::clone(&rate_limits),
            settings.current().cache.cleanup_interval(),
            background.child_token(),
            span.clone(),
        );

        Self {
            parser: AmountParser::new(settings.clone()),
            currencies: CurrencyPolicy::new(Arc::clone(engine.ledger()), settings.clone())
                .with_span(span.clone()),
            cooldowns,
            rate_limits,
            confirmations: ConfirmationManager::with_span(
                settings.clone(),
                Arc::clone(&notifier),
                span.clone(),
            ),
            engine,
            notifier,
            settings,
            span,
            background,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Parse and bound-check the amount, and admit the currency
    async fn admit(
        &self,
        currency: &str,
        amount: &str,
        privileges: Privileges,
    ) -> Result<Decimal, TransferError> {
        self.currencies.validate(currency).await?;
        let amount = self.parser.parse(amount)?;
        self.parser.validate(amount, privileges.bypass_limits)?;
        Ok(amount)
    }

    fn check_cooldown(&self, sender: AccountId, privileges: Privileges) -> Result<(), TransferError> {
        if self.cooldowns.is_on_cooldown(sender, privileges) {
            return Err(TransferError::OnCooldown {
                remaining_secs: self.cooldowns.remaining_cooldown(sender),
            });
        }
        Ok(())
    }

    /// Fail early when `sender` cannot cover `required`
    async fn check_funds(
        &self,
        sender: AccountId,
        currency: &str,
        required: Decimal,
    ) -> Result<(), TransferError> {
        let available = self.engine.cache().get_balance(sender, currency).await?;
        if available < required {
            return Err(TransactionErrorKind::InsufficientFunds {
                available,
                required,
            }
            .into());
        }
        Ok(())
    }

    /// Run every gate and either execute or park the transfer
    ///
    /// # Returns
    ///
    /// * `Ok(Completed)` - The transfer went through
    /// * `Ok(ConfirmationRequired)` - The amount is above the threshold; call
    ///   [`Self::confirm`] within the timeout
    /// * `Err(_)` - A gate rejected the transfer or the engine failed it
    pub async fn pay(
        &self,
        request: PaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<PaymentOutcome, TransferError> {
        Self::check_cancelled(cancel)?;
        let settings = self.settings.current();

        if request.sender == Some(request.receiver) && !settings.engine.allow_self_transfer {
            return Err(TransferError::SelfTransfer);
        }
        let amount = self
            .admit(&request.currency, &request.amount, request.privileges)
            .await?;

        if let Some(sender) = request.sender {
            self.check_cooldown(sender, request.privileges)?;
            if self.rate_limits.is_rate_limited(sender) {
                return Err(TransferError::RateLimited);
            }
            let required = settings
                .tax
                .total_for(amount)
                .ok_or_else(|| too_large(amount))?;
            self.check_funds(sender, &request.currency, required).await?;

            if self.confirmations.requires_confirmation(amount) {
                let pending =
                    PendingTransaction::new(sender, request.receiver, &request.currency, amount);
                self.confirmations.create_confirmation(pending.clone());
                tracing::debug!(
                    parent: &self.span,
                    sender = %sender,
                    amount = %amount,
                    "Transfer awaiting confirmation"
                );
                return Ok(PaymentOutcome::ConfirmationRequired(pending));
            }
        }

        Self::check_cancelled(cancel)?;
        self.execute(
            request.sender,
            request.receiver,
            &request.currency,
            amount,
            request.privileges,
        )
        .await
        .map(PaymentOutcome::Completed)
    }

    /// Execute the sender's pending transfer
    pub async fn confirm(
        &self,
        sender: AccountId,
        privileges: Privileges,
        cancel: &CancellationToken,
    ) -> Result<Transaction, TransferError> {
        Self::check_cancelled(cancel)?;
        let pending = self
            .confirmations
            .confirm(sender)
            .ok_or(TransferError::NoPendingConfirmation)?;
        self.execute(
            Some(sender),
            pending.receiver,
            &pending.currency,
            pending.amount,
            privileges,
        )
        .await
    }

    /// Drop the sender's pending transfer
    pub fn cancel_pending(&self, sender: AccountId) -> Result<(), TransferError> {
        if self.confirmations.cancel(sender) {
            Ok(())
        } else {
            Err(TransferError::NoPendingConfirmation)
        }
    }

    async fn execute(
        &self,
        sender: Option<AccountId>,
        receiver: AccountId,
        currency: &str,
        amount: Decimal,
        privileges: Privileges,
    ) -> Result<Transaction, TransferError> {
        match self
            .engine
            .process_transaction(sender, receiver, currency, amount, true)
            .await
        {
            Ok(transaction) => {
                if let Some(sender) = sender {
                    self.cooldowns.set_cooldown(sender, privileges);
                    self.rate_limits.record_transaction(sender);
                    self.notifier.notify(
                        Recipient::Account(sender),
                        Notice::PaymentSent {
                            transaction: transaction.clone(),
                        },
                    );
                }
                self.notifier.notify(
                    Recipient::Account(receiver),
                    Notice::PaymentReceived {
                        transaction: transaction.clone(),
                    },
                );
                Ok(transaction)
            }
            Err(kind) => {
                if let Some(sender) = sender {
                    self.notifier.notify(
                        Recipient::Account(sender),
                        Notice::TransferFailed {
                            currency: currency.to_string(),
                            amount,
                            key: kind.key(),
                        },
                    );
                }
                Err(kind.into())
            }
        }
    }

    /// Pay `amount` to every account in `recipients` except the sender
    ///
    /// The sender must cover every transfer plus tax up front. Transfers run
    /// in concurrent chunks; individual failures are reported, not fatal.
    pub async fn pay_all(
        &self,
        sender: AccountId,
        privileges: Privileges,
        recipients: &[AccountId],
        currency: &str,
        amount: &str,
        cancel: &CancellationToken,
    ) -> Result<PayAllReport, TransferError> {
        Self::check_cancelled(cancel)?;
        let started = std::time::Instant::now();
        let settings = self.settings.current();

        let amount = self.admit(currency, amount, privileges).await?;
        let mut targets: Vec<AccountId> = recipients
            .iter()
            .copied()
            .filter(|recipient| *recipient != sender)
            .collect();
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            return Err(TransferError::NoRecipients);
        }

        let required = settings
            .tax
            .total_for(amount)
            .and_then(|per_recipient| per_recipient.checked_mul(Decimal::from(targets.len())))
            .ok_or_else(|| too_large(amount))?;
        self.check_funds(sender, currency, required).await?;
        self.check_cooldown(sender, privileges)?;

        Self::check_cancelled(cancel)?;
        let mut report = PayAllReport::default();
        for chunk in targets.chunks(PAY_ALL_CHUNK) {
            let results = join_all(chunk.iter().map(|receiver| {
                self.engine
                    .process_transaction(Some(sender), *receiver, currency, amount, true)
            }))
            .await;
            for (receiver, result) in chunk.iter().zip(results) {
                match result {
                    Ok(transaction) => {
                        self.notifier.notify(
                            Recipient::Account(*receiver),
                            Notice::PaymentReceived {
                                transaction: transaction.clone(),
                            },
                        );
                        report.succeeded.push(transaction);
                    }
                    Err(kind) => report.failed.push((*receiver, kind)),
                }
            }
        }

        if !report.succeeded.is_empty() {
            self.cooldowns.set_cooldown(sender, privileges);
            self.rate_limits.record_transaction(sender);
        }
        report.elapsed = started.elapsed();
        tracing::info!(
            parent: &self.span,
            sender = %sender,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pay-all finished"
        );
        Ok(report)
    }

    /// Newest-first history, `max_history` entries when `limit` is `None`
    pub async fn history(
        &self,
        account: AccountId,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, StorageError> {
        let limit = limit.unwrap_or(self.settings.current().persistence.max_history);
        self.engine.transaction_history(account, limit).await
    }

    pub async fn stats(&self, account: AccountId) -> Result<TransactionStats, StorageError> {
        self.engine.transaction_stats(account).await
    }

    /// Session start: report payments received since the last session
    ///
    /// # Returns
    ///
    /// The transfers received while away (empty on a first session).
    pub async fn on_join(&self, account: AccountId) -> Result<Vec<Transaction>, StorageError> {
        let storage = self.engine.storage();
        let now = Utc::now();

        let received = match storage.last_login(account).await? {
            Some(since) => storage
                .history_since(account, since, OFFLINE_HISTORY_LIMIT)
                .await?
                .into_iter()
                .filter(|transaction| transaction.receiver == account)
                .collect(),
            None => Vec::new(),
        };
        if !received.is_empty() {
            self.notifier.notify(
                Recipient::Account(account),
                Notice::OfflinePayments {
                    transactions: received.clone(),
                },
            );
        }

        storage.record_last_login(account, now).await?;
        Ok(received)
    }

    /// Session end: drop whatever the account had pending
    pub fn on_leave(&self, account: AccountId) {
        self.confirmations.cancel(account);
    }

    /// Delete history older than `retention_days`
    pub async fn purge_history(&self) -> Result<usize, StorageError> {
        let days = self.settings.current().persistence.retention_days;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let purged = self.engine.storage().purge_older_than(cutoff).await?;
        tracing::info!(parent: &self.span, purged, retention_days = days, "Purged old history");
        Ok(purged)
    }

    /// Install new settings for every later operation
    pub fn reload(&self, settings: Settings) {
        self.settings.replace(settings);
        self.currencies.clear_cache();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    pub fn engine(&self) -> &Arc<TransactionManager> {
        &self.engine
    }

    pub fn parser(&self) -> &AmountParser {
        &self.parser
    }

    pub fn confirmations(&self) -> &ConfirmationManager {
        &self.confirmations
    }

    pub fn cooldowns(&self) -> &CooldownManager {
        &self.cooldowns
    }

    pub fn rate_limits(&self) -> &RateLimitManager {
        &self.rate_limits
    }

    /// Drop pending confirmations, then shut the engine down
    pub async fn shutdown(&self) {
        self.background.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.confirmations.cleanup();
        self.engine.shutdown().await;
    }
}
