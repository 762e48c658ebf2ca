//! Amount parsing, validation and display
//!
//! Users type amounts such as `250`, `10k` or `2.5M`. Suffixes are matched
//! case-insensitively against the configured table, longest first, so a
//! `kk` suffix wins over `k` when both are configured.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::core::Ledger;
use crate::settings::{FormatSettings, SettingsHandle};
use crate::types::AmountError;

/// Reads the format and limit settings at every call
#[derive(Debug, Clone, Default)]
pub struct AmountParser {
    settings: SettingsHandle,
}

/// Group and decimal separators for a locale tag
fn separators(locale: &str) -> (&'static str, &'static str) {
    match locale {
        "de_DE" | "es_ES" | "pt_BR" | "it_IT" | "nl_NL" | "id_ID" => (".", ","),
        "fr_FR" | "pl_PL" | "ru_RU" | "sv_SE" => (" ", ","),
        _ => (",", "."),
    }
}

fn split_suffix<'a>(input: &'a str, formats: &FormatSettings) -> Option<(&'a str, Decimal)> {
    let mut suffixes: Vec<(&String, &Decimal)> = formats
        .suffixes
        .iter()
        .filter(|(suffix, _)| !suffix.is_empty())
        .collect();
    suffixes.sort_by_key(|(suffix, _)| std::cmp::Reverse(suffix.len()));

    suffixes.into_iter().find_map(|(suffix, factor)| {
        let cut = input.len().checked_sub(suffix.len())?;
        let tail = input.get(cut..)?;
        tail.eq_ignore_ascii_case(suffix)
            .then(|| (&input[..cut], *factor))
    })
}

impl AmountParser {
    pub fn new(settings: SettingsHandle) -> Self {
        Self { settings }
    }

    /// Parse user input into an amount
    ///
    /// # Errors
    ///
    /// * `Empty` - Nothing but whitespace
    /// * `InvalidFormat` - The numeric part is not a number, the result
    ///   overflows, or it has a fraction while decimals are disallowed
    pub fn parse(&self, input: &str) -> Result<Decimal, AmountError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AmountError::Empty);
        }
        let settings = self.settings.current();
        let formats = &settings.formats;

        let (number, factor) = if formats.suffixes_enabled {
            split_suffix(trimmed, formats).unwrap_or((trimmed, Decimal::ONE))
        } else {
            (trimmed, Decimal::ONE)
        };

        let number = number.trim();
        if number.is_empty() || number.contains('_') {
            return Err(AmountError::invalid_format(trimmed));
        }
        let amount = Decimal::from_str(number)
            .ok()
            .and_then(|value| value.checked_mul(factor))
            .ok_or_else(|| AmountError::invalid_format(trimmed))?;

        if !formats.allow_decimals && !amount.fract().is_zero() {
            return Err(AmountError::invalid_format(trimmed));
        }
        Ok(amount.normalize())
    }

    /// Check `amount` against the configured bounds
    ///
    /// Non-positive amounts are rejected even when `bypass_limits` is set.
    pub fn validate(&self, amount: Decimal, bypass_limits: bool) -> Result<(), AmountError> {
        if amount <= Decimal::ZERO {
            return Err(AmountError::NonPositive { amount });
        }
        let settings = self.settings.current();
        let limits = &settings.limits;
        if bypass_limits || !limits.enabled {
            return Ok(());
        }
        if amount < limits.minimum {
            return Err(AmountError::AmountTooLow {
                amount,
                minimum: limits.minimum,
            });
        }
        if limits.maximum > Decimal::ZERO && amount > limits.maximum {
            return Err(AmountError::AmountTooHigh {
                amount,
                maximum: limits.maximum,
            });
        }
        Ok(())
    }

    /// Grouped, rounded display form of `amount`
    pub fn format(&self, amount: Decimal) -> String {
        let settings = self.settings.current();
        let formats = &settings.formats;
        let (group, point) = separators(&formats.locale);

        let rounded = amount.round_dp(formats.decimal_places).normalize();
        let text = rounded.abs().to_string();
        let (integer, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));

        let mut grouped = String::with_capacity(text.len() + integer.len() / 3 + 1);
        if rounded.is_sign_negative() && !rounded.is_zero() {
            grouped.push('-');
        }
        for (i, digit) in integer.chars().enumerate() {
            if i > 0 && (integer.len() - i) % 3 == 0 {
                grouped.push_str(group);
            }
            grouped.push(digit);
        }
        if !fraction.is_empty() {
            grouped.push_str(point);
            grouped.push_str(fraction);
        }
        grouped
    }

    /// [`Self::format`] followed by the currency's display name
    pub async fn format_with_currency(
        &self,
        amount: Decimal,
        currency: &str,
        ledger: &dyn Ledger,
    ) -> String {
        let name = ledger.currency_display_name(currency).await;
        format!("{} {}", self.format(amount), name)
    }
}
