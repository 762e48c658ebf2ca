//! In-memory ledger backed by `DashMap`
//!
//! Balances are keyed by `(account, currency)` and mutated under the entry
//! lock, so each call is atomic on its own exactly like a remote ledger.
//! Faults can be injected per operation and account to exercise the
//! engine's rollback path.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::core::Ledger;
use crate::types::{AccountId, CurrencyCode, LedgerError};

/// Ledger operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Add,
    Remove,
    Read,
}

/// Thread-safe in-memory ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    /// Currency code to display name
    currencies: DashMap<CurrencyCode, String>,

    balances: DashMap<(AccountId, CurrencyCode), Decimal>,

    /// Remaining injected failures per operation and account
    faults: DashMap<(LedgerOp, AccountId), u32>,

    reads: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that already knows `currencies` (display name = code)
    pub fn with_currencies<I, S>(currencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CurrencyCode>,
    {
        let ledger = Self::new();
        for currency in currencies {
            let currency = currency.into();
            ledger.register_currency(currency.clone(), currency);
        }
        ledger
    }

    pub fn register_currency(&self, code: impl Into<CurrencyCode>, display_name: impl Into<String>) {
        self.currencies.insert(code.into(), display_name.into());
    }

    /// Overwrite a balance, registering the currency if needed
    pub fn set_balance(&self, account: AccountId, currency: &str, balance: Decimal) {
        if !self.currencies.contains_key(currency) {
            self.register_currency(currency, currency);
        }
        self.balances.insert((account, currency.to_string()), balance);
    }

    /// Balance without counting a read or consulting faults
    pub fn peek(&self, account: AccountId, currency: &str) -> Decimal {
        self.balances
            .get(&(account, currency.to_string()))
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of every balance held in `currency`
    pub fn total_supply(&self, currency: &str) -> Decimal {
        self.balances
            .iter()
            .filter(|entry| entry.key().1 == currency)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Every `(account, currency, balance)` triple, sorted for stable output
    pub fn snapshot(&self) -> Vec<(AccountId, CurrencyCode, Decimal)> {
        let mut rows: Vec<_> = self
            .balances
            .iter()
            .map(|entry| (entry.key().0, entry.key().1.clone(), *entry.value()))
            .collect();
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        rows
    }

    /// Make the next `times` calls of `op` against `account` fail
    pub fn fail_next(&self, op: LedgerOp, account: AccountId, times: u32) {
        self.faults.insert((op, account), times);
    }

    /// Number of balance reads served so far
    pub fn balance_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn take_fault(&self, op: LedgerOp, account: AccountId) -> Result<(), LedgerError> {
        let mut tripped = false;
        self.faults.remove_if_mut(&(op, account), |_, remaining| {
            tripped = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        });
        if tripped {
            Err(LedgerError::backend(format!(
                "injected {:?} fault for {}",
                op, account
            )))
        } else {
            Ok(())
        }
    }

    fn ensure_currency(&self, currency: &str) -> Result<(), LedgerError> {
        if self.currencies.contains_key(currency) {
            Ok(())
        } else {
            Err(LedgerError::UnknownCurrency {
                currency: currency.to_string(),
            })
        }
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn currency_exists(&self, currency: &str) -> Result<bool, LedgerError> {
        Ok(self.currencies.contains_key(currency))
    }

    async fn balance(&self, account: AccountId, currency: &str) -> Result<Decimal, LedgerError> {
        self.take_fault(LedgerOp::Read, account)?;
        self.ensure_currency(currency)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(account, currency))
    }

    async fn add_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError> {
        self.take_fault(LedgerOp::Add, account)?;
        self.ensure_currency(currency)?;
        let mut entry = self
            .balances
            .entry((account, currency.to_string()))
            .or_insert(Decimal::ZERO);
        let updated = entry
            .value()
            .checked_add(delta)
            .ok_or_else(|| LedgerError::backend("balance overflow"))?;
        *entry.value_mut() = updated;
        Ok(())
    }

    async fn remove_balance(
        &self,
        account: AccountId,
        currency: &str,
        delta: Decimal,
    ) -> Result<(), LedgerError> {
        self.take_fault(LedgerOp::Remove, account)?;
        self.ensure_currency(currency)?;
        let mut entry = self
            .balances
            .entry((account, currency.to_string()))
            .or_insert(Decimal::ZERO);
        let available = *entry.value();
        if available < delta {
            return Err(LedgerError::InsufficientBalance {
                account,
                currency: currency.to_string(),
                available,
                requested: delta,
            });
        }
        *entry.value_mut() = available - delta;
        Ok(())
    }

    async fn currency_display_name(&self, currency: &str) -> String {
        self.currencies
            .get(currency)
            .map(|name| name.value().clone())
            .unwrap_or_else(|| currency.to_string())
    }
}
