//! Background maintenance tasks, spawned once at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::engine::Engine;
use crate::model::unix_now_ms;

const COMPACT_CHECK_INTERVAL_SECS: u64 = 60;

/// Periodically reconcile bookings against the wall clock. Requests also
/// reconcile lazily, so this only matters for users who stay away while
/// their bookings start or expire.
pub async fn run_reconciler(engine: Arc<Engine>, interval_secs: u64) {
    let mut tick = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        match engine.reconcile(unix_now_ms()).await {
            Ok(summary) if !summary.is_noop() => {
                tracing::info!(
                    activated = summary.activated,
                    expired = summary.expired,
                    "reconciled bookings"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "reconciliation failed"),
        }
    }
}

/// Compact the WAL once enough transactions have accumulated since the
/// last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut tick = tokio::time::interval(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => tracing::info!(appends, "compacted WAL"),
            Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
        }
    }
}
