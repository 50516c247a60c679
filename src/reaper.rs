use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::ledger::Ledger;

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that periodically drops expired reservation holds.
pub async fn run_reaper(engine: Arc<Engine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reaped = engine.reap_expired_holds().await;
                if reaped > 0 {
                    debug!("reaped {reaped} expired holds");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("reaper stopped");
}

/// Rewrite the ledger WAL once it has grown by `threshold` appends.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let appends = ledger.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match ledger.compact_wal().await {
                    Ok(()) => info!("compacted ledger WAL after {appends} appends"),
                    Err(e) => warn!("ledger WAL compaction failed: {e}"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("compactor stopped");
}
