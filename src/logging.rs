//! Structured logging
//!
//! Installs the `tracing` subscriber with a pretty or JSON format and
//! `RUST_LOG` based filtering. Output goes to stderr; stdout carries the
//! balance CSV.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for local runs
    Pretty,
    /// JSON lines for log aggregation
    Json,
}

/// Initialize the global tracing subscriber
///
/// Call once, early in `main()`; a second call panics. `RUST_LOG` overrides
/// `default_level` when set, e.g. `RUST_LOG=rust_transfer_engine=debug`.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(true),
                )
                .init();
        }
    }

    tracing::debug!(?format, "Logging initialized");
}
