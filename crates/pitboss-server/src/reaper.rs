//! Periodic removal of agent sessions that stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pitboss_registry::Registry;

/// Sweep every `interval`, dropping sessions expired for longer than
/// `grace`. Returns when `shutdown` fires.
pub async fn run_reaper(registry: Arc<Registry>, interval: Duration, grace: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reaper stopped");
                return;
            }
            _ = ticker.tick() => {
                registry.reap_expired(grace);
            }
        }
    }
}
