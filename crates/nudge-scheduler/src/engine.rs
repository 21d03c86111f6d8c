//! Scan loop — runs the inactivity scan on a fixed tokio interval.
//! Sleeps between ticks, so an idle engine costs nothing.

use std::sync::Arc;
use std::time::Duration;

use crate::enqueuer::{Enqueuer, ScanSummary};

/// Run one scan, logging instead of propagating failures.
pub async fn run_scan(enqueuer: &Enqueuer) -> Option<ScanSummary> {
    match enqueuer.scan_and_enqueue_inactive_contacts().await {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::error!("❌ Inactivity scan failed: {e}");
            None
        }
    }
}

/// Spawn the scan loop as a background tokio task. The first scan runs
/// immediately.
pub async fn spawn_scan_loop(enqueuer: Arc<Enqueuer>, interval_secs: u64) {
    let interval_secs = interval_secs.max(1);
    tracing::info!("⏰ Follow-up scan started (every {}s)", interval_secs);

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if let Some(summary) = run_scan(&enqueuer).await {
            if summary.enqueued > 0 {
                tracing::info!("📣 {} contact(s) entered a follow-up sequence", summary.enqueued);
            }
        }
    }
}
