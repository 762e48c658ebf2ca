use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;
use crate::replay::ReplayOptions;
use crate::settings::Settings;

/// Replay currency transfers against an in-memory ledger
#[derive(Parser, Debug)]
#[command(name = "transfer-engine")]
#[command(about = "Replay currency transfers against an in-memory ledger", long_about = None)]
pub struct CliArgs {
    /// Transfer CSV: action,sender,receiver,currency,amount
    #[arg(value_name = "TRANSFERS_CSV", help = "Path to the transfer CSV file")]
    pub transfers: PathBuf,

    /// Balance seed CSV: account,currency,balance
    #[arg(long = "balances", value_name = "CSV")]
    pub balances: Option<PathBuf>,

    /// TOML settings file, overridden by TRANSFER__* environment variables
    #[arg(long = "config", value_name = "FILE", env = "TRANSFER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write the persisted transfer history to this CSV file
    #[arg(long = "history", value_name = "CSV")]
    pub history: Option<PathBuf>,

    /// Log output format (logs go to stderr)
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Execute transfers inline instead of on the worker pool
    #[arg(long = "sync")]
    pub sync: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl CliArgs {
    pub fn replay_options(&self) -> ReplayOptions {
        ReplayOptions {
            transfers: self.transfers.clone(),
            balances: self.balances.clone(),
            history: self.history.clone(),
        }
    }

    /// Apply command-line overrides on top of loaded settings
    pub fn apply_overrides(&self, mut settings: Settings) -> Settings {
        if self.sync {
            settings.engine.async_operations = false;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_format(&["program", "in.csv"], LogFormatArg::Pretty)]
    #[case::json(&["program", "--log-format", "json", "in.csv"], LogFormatArg::Json)]
    fn test_log_format_parsing(#[case] args: &[&str], #[case] expected: LogFormatArg) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.log_format, expected);
    }

    #[test]
    fn test_all_options() {
        let parsed = CliArgs::try_parse_from([
            "program",
            "--balances",
            "seed.csv",
            "--history",
            "out.csv",
            "--config",
            "engine.toml",
            "--sync",
            "in.csv",
        ])
        .unwrap();

        let options = parsed.replay_options();
        assert_eq!(options.transfers, PathBuf::from("in.csv"));
        assert_eq!(options.balances, Some(PathBuf::from("seed.csv")));
        assert_eq!(options.history, Some(PathBuf::from("out.csv")));
        assert_eq!(parsed.config, Some(PathBuf::from("engine.toml")));
        assert!(parsed.sync);
    }

    #[rstest]
    #[case::sync(&["program", "--sync", "in.csv"], false)]
    #[case::pool(&["program", "in.csv"], true)]
    fn test_sync_flag_override(#[case] args: &[&str], #[case] async_operations: bool) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        let settings = parsed.apply_overrides(Settings::default());
        assert_eq!(settings.engine.async_operations, async_operations);
    }

    #[rstest]
    #[case::missing_input(&["program"])]
    #[case::invalid_log_format(&["program", "--log-format", "xml", "in.csv"])]
    fn test_parsing_errors(#[case] args: &[&str]) {
        assert!(CliArgs::try_parse_from(args).is_err());
    }
}
