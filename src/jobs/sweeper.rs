//! Background job: deletion-request maintenance.
//!
//! Each tick expires pending requests past their backoff, retries the
//! destructive action for requests stuck in `approved`, then purges terminal
//! requests older than the retention window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::deletion::ApprovalCoordinator;

#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: usize,
    pub purged: u64,
}

/// Spawn the sweeper. Call this once at startup.
pub fn spawn(
    coordinator: Arc<ApprovalCoordinator>,
    period: Duration,
    retention: chrono::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = sweep_once(&coordinator, retention).await;
            if report.expired + report.completed > 0 || report.purged > 0 {
                tracing::info!(
                    expired = report.expired,
                    completed = report.completed,
                    purged = report.purged,
                    "deletion sweep finished"
                );
            }
        }
    })
}

/// Run every maintenance step once. A failing step is logged and the
/// remaining steps still run.
pub async fn sweep_once(
    coordinator: &ApprovalCoordinator,
    retention: chrono::Duration,
) -> SweepReport {
    let expired = match coordinator.expire_stale_requests().await {
        Ok(expired) => expired.len(),
        Err(e) => {
            tracing::error!("expiry sweep failed: {}", e);
            0
        }
    };

    let completed = match coordinator.complete_approved_requests().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("completion sweep failed: {}", e);
            0
        }
    };

    let purged = match coordinator.purge_resolved_requests(retention).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("purge sweep failed: {}", e);
            0
        }
    };

    SweepReport {
        expired,
        completed,
        purged,
    }
}
