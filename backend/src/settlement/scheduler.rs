// Interval loops: poll expiry (every minute) and vote expiry (every five)
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::{PassReport, Reconciler};
use crate::error::{AppError, AppResult};

pub(crate) async fn run_poll_expiry_loop(reconciler: Arc<Reconciler>) {
    let period = reconciler.settings.poll_interval;
    run_every("poll expiry", period, &reconciler, |r| async move {
        r.close_expired_polls().await
    })
    .await
}

pub(crate) async fn run_vote_expiry_loop(reconciler: Arc<Reconciler>) {
    let period = reconciler.settings.vote_interval;
    run_every("vote expiry", period, &reconciler, |r| async move {
        r.expire_votes().await
    })
    .await
}

/// Tick until shutdown. Pass errors are logged; the loop only ends on
/// cancellation.
async fn run_every<F, Fut>(name: &str, period: Duration, reconciler: &Arc<Reconciler>, pass: F)
where
    F: Fn(Arc<Reconciler>) -> Fut,
    Fut: std::future::Future<Output = AppResult<PassReport>>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = reconciler.shutdown.cancelled() => {
                info!("✓ {} loop stopped", name);
                return;
            }
            _ = ticker.tick() => {}
        }

        match pass(reconciler.clone()).await {
            Ok(report) if report.processed + report.failed > 0 => {
                info!(
                    "🔄 {} pass: {} processed, {} failed",
                    name, report.processed, report.failed
                );
            }
            Ok(_) => {}
            Err(AppError::Cancelled) => {
                info!("✓ {} loop stopped", name);
                return;
            }
            Err(e) => error!("❌ {} pass failed: {}", name, e),
        }
    }
}
