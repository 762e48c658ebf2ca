//! Rust Transfer Engine CLI
//!
//! Replays a transfer CSV against an in-memory ledger.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- transfers.csv --balances seed.csv > balances.csv
//! cargo run -- transfers.csv --balances seed.csv --history history.csv --sync
//! RUST_LOG=debug cargo run -- transfers.csv --log-format json > balances.csv
//! ```
//!
//! Final balances go to stdout, logs to stderr.
//!
//! # Exit Codes
//!
//! - 0: Success (rejected rows are logged, not fatal)
//! - 1: Error (bad arguments or settings, unreadable input, unwritable output)

use anyhow::Context;
use rust_transfer_engine::cli;
use rust_transfer_engine::logging::init_logging;
use rust_transfer_engine::replay;
use rust_transfer_engine::settings::Settings;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    let args = cli::parse_args();
    init_logging("info", args.log_format.into());

    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    let settings = args.apply_overrides(settings);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.engine.worker_threads)
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let options = args.replay_options();
    let summary = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing current row");
                on_signal.cancel();
            }
        });

        let mut output = std::io::stdout().lock();
        replay::run(settings, &options, &mut output, cancel).await
    })?;

    tracing::info!(
        completed = summary.completed,
        rejected = summary.rejected,
        "Done"
    );
    Ok(())
}
