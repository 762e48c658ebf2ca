//! Caller-side admission gates
//!
//! Checks a transfer has to pass before the engine is invoked:
//! - `cooldown` - Minimum delay between two transfers of one sender
//! - `rate_limit` - Maximum transfers per sender in a sliding window
//! - `confirmation` - Explicit confirmation of large transfers
//!
//! Gate state lives in process memory and is not shared between instances.

pub mod confirmation;
pub mod cooldown;
pub mod rate_limit;

pub use confirmation::ConfirmationManager;
pub use cooldown::CooldownManager;
pub use rate_limit::RateLimitManager;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Every `period`, forget expired cooldowns and empty rate-limit windows
pub fn spawn_gate_sweeper(
    cooldowns: Arc<CooldownManager>,
    rate_limits: Arc<RateLimitManager>,
    period: Duration,
    token: CancellationToken,
    span: tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let cooldowns = cooldowns.cleanup_expired();
                    let windows = rate_limits.cleanup_idle();
                    if cooldowns + windows > 0 {
                        tracing::debug!(
                            parent: &span,
                            cooldowns,
                            windows,
                            "Swept idle gate state"
                        );
                    }
                }
            }
        }
    })
}
