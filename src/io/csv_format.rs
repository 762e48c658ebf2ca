//! CSV format handling for replay input and engine output
//!
//! This module centralizes all CSV format concerns, providing:
//! - `TransferRow` / `BalanceRow` structures for deserialization
//! - Conversion from CSV rows to replay actions and seed balances
//! - Balance and history output serialization
//!
//! All functions are pure (no I/O) for easy testing.

use std::io::Write;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::types::{AccountId, CurrencyCode, Transaction};

/// Sender column value naming the system actor
const SYSTEM_LABEL: &str = "system";

/// Transfer CSV row: `action,sender,receiver,currency,amount`
///
/// Only `action` is required by the CSV layer; which of the other columns
/// must be present depends on the action.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct TransferRow {
    pub action: String,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub currency: Option<String>,
    pub amount: Option<String>,
}

/// Balance seed CSV row: `account,currency,balance`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BalanceRow {
    pub account: String,
    pub currency: String,
    pub balance: String,
}

/// One step of a replay
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayAction {
    /// Single transfer, `sender` is `None` for the system actor
    Pay {
        sender: Option<AccountId>,
        receiver: AccountId,
        currency: CurrencyCode,
        amount: String,
    },
    /// Execute the sender's pending transfer
    Confirm { sender: AccountId },
    /// Drop the sender's pending transfer
    Cancel { sender: AccountId },
    /// Pay every known account
    PayAll {
        sender: AccountId,
        currency: CurrencyCode,
        amount: String,
    },
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn parse_account(value: &str) -> Result<AccountId, String> {
    Uuid::from_str(value).map_err(|_| format!("Invalid account id '{}'", value))
}

fn required<'a>(field: &'a Option<String>, name: &str, action: &str) -> Result<&'a str, String> {
    non_empty(field).ok_or_else(|| format!("'{}' is missing the {} column", action, name))
}

/// Sender column: empty or `system` selects the system actor
fn parse_sender(field: &Option<String>) -> Result<Option<AccountId>, String> {
    match non_empty(field) {
        None => Ok(None),
        Some(value) if value.eq_ignore_ascii_case(SYSTEM_LABEL) => Ok(None),
        Some(value) => parse_account(value).map(Some),
    }
}

fn player_sender(row: &TransferRow, action: &str) -> Result<AccountId, String> {
    parse_sender(&row.sender)?.ok_or_else(|| format!("'{}' requires a player sender", action))
}

/// Convert a TransferRow to a ReplayAction
///
/// The amount is kept in user notation (`10k`, `2.5M`) so that it goes
/// through the same parser as any other caller input.
///
/// # Returns
///
/// Result containing either:
/// - Ok(ReplayAction) - Successfully converted row
/// - Err(String) - Error message describing the conversion failure
pub fn convert_transfer_row(row: TransferRow) -> Result<ReplayAction, String> {
    let action = row.action.trim().to_lowercase();
    match action.as_str() {
        "pay" => Ok(ReplayAction::Pay {
            sender: parse_sender(&row.sender)?,
            receiver: parse_account(required(&row.receiver, "receiver", &action)?)?,
            currency: required(&row.currency, "currency", &action)?.to_string(),
            amount: required(&row.amount, "amount", &action)?.to_string(),
        }),
        "confirm" => Ok(ReplayAction::Confirm {
            sender: player_sender(&row, &action)?,
        }),
        "cancel" => Ok(ReplayAction::Cancel {
            sender: player_sender(&row, &action)?,
        }),
        "payall" => Ok(ReplayAction::PayAll {
            sender: player_sender(&row, &action)?,
            currency: required(&row.currency, "currency", &action)?.to_string(),
            amount: required(&row.amount, "amount", &action)?.to_string(),
        }),
        _ => Err(format!("Invalid action: '{}'", row.action)),
    }
}

/// Convert a BalanceRow to a seed balance
///
/// Seed balances are plain decimals; negative balances are rejected.
pub fn convert_balance_row(row: BalanceRow) -> Result<(AccountId, CurrencyCode, Decimal), String> {
    let account = parse_account(row.account.trim())?;
    let currency = row.currency.trim();
    if currency.is_empty() {
        return Err(format!("Missing currency for account {}", account));
    }
    let balance = Decimal::from_str(row.balance.trim())
        .map_err(|_| format!("Invalid balance '{}' for account {}", row.balance, account))?;
    if balance.is_sign_negative() && !balance.is_zero() {
        return Err(format!("Negative balance {} for account {}", balance, account));
    }
    Ok((account, currency.to_string(), balance))
}

/// Write balances to CSV format
///
/// Rows are sorted by account then currency for deterministic output.
/// Amounts are written in normalized form (`100`, `12.5`).
pub fn write_balances_csv(
    balances: &[(AccountId, CurrencyCode, Decimal)],
    output: &mut dyn Write,
) -> Result<(), String> {
    let mut sorted: Vec<&(AccountId, CurrencyCode, Decimal)> = balances.iter().collect();
    sorted.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    let mut writer = csv::Writer::from_writer(output);
    writer
        .write_record(["account", "currency", "balance"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for (account, currency, balance) in sorted {
        writer
            .write_record([
                account.to_string(),
                currency.clone(),
                balance.normalize().to_string(),
            ])
            .map_err(|e| format!("Failed to write balance row: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush CSV writer: {}", e))
}

/// Write persisted transfers to CSV format
///
/// Columns: `id,sender,receiver,currency,amount,tax,timestamp`. The sender
/// column is `system` for system disbursements; timestamps are RFC 3339.
pub fn write_history_csv(transactions: &[Transaction], output: &mut dyn Write) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(output);
    writer
        .write_record([
            "id",
            "sender",
            "receiver",
            "currency",
            "amount",
            "tax",
            "timestamp",
        ])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for transaction in transactions {
        let sender = transaction
            .sender
            .map_or_else(|| SYSTEM_LABEL.to_string(), |sender| sender.to_string());
        writer
            .write_record([
                transaction.id.to_string(),
                sender,
                transaction.receiver.to_string(),
                transaction.currency.clone(),
                transaction.amount.normalize().to_string(),
                transaction.tax().normalize().to_string(),
                transaction.timestamp.to_rfc3339(),
            ])
            .map_err(|e| format!("Failed to write history row for {}: {}", transaction.id, e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush CSV writer: {}", e))
}
