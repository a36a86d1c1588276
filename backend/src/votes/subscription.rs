// Per-vote invoice subscription
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mark_invoice_paid;
use crate::context::OpContext;
use crate::gateway::PaymentGateway;
use crate::ledger::VoteLedger;

/// Non-terminal events a subscription accepts before giving up. The
/// vote-expiry loop and the settlement stream cover anything missed.
pub const MAX_SUBSCRIPTION_EVENTS: usize = 5;

/// Watch one vote's invoice until it is paid, cancelled, or the event budget
/// runs out. Never outlives `cancel`.
pub fn spawn_subscription(
    votes: Arc<dyn VoteLedger>,
    gateway: Arc<dyn PaymentGateway>,
    cancel: CancellationToken,
    vote_id: i64,
    payment_hash: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_subscription(votes, gateway, cancel, vote_id, payment_hash).await;
    })
}

async fn run_subscription(
    votes: Arc<dyn VoteLedger>,
    gateway: Arc<dyn PaymentGateway>,
    cancel: CancellationToken,
    vote_id: i64,
    payment_hash: String,
) {
    let ctx = OpContext::new(cancel);

    let mut stream = match ctx.run(gateway.subscribe_invoice(&payment_hash)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Vote {} subscription failed to start: {}", vote_id, e);
            return;
        }
    };

    let mut events = 0;
    loop {
        let next = tokio::select! {
            _ = ctx.token().cancelled() => {
                debug!("Vote {} subscription cancelled", vote_id);
                return;
            }
            next = stream.next() => next,
        };

        let update = match next {
            Some(Ok(update)) => update,
            Some(Err(e)) => {
                warn!("Vote {} subscription error: {}", vote_id, e);
                return;
            }
            None => {
                debug!("Vote {} subscription closed by node", vote_id);
                return;
            }
        };

        if update.state.is_paid() {
            match mark_invoice_paid(&ctx, votes.as_ref(), &update).await {
                Ok(()) => info!("⚡ Vote {} paid ({} sats)", vote_id, update.amount_paid_sat),
                Err(e) if e.is_conflict() => debug!("Vote {} already resolved", vote_id),
                Err(e) => error!("Failed to mark vote {} paid: {}", vote_id, e),
            }
            return;
        }

        if update.state.is_final() {
            debug!("Vote {} invoice cancelled", vote_id);
            return;
        }

        events += 1;
        if events >= MAX_SUBSCRIPTION_EVENTS {
            warn!(
                "Vote {} subscription stopped after {} events without payment",
                vote_id, events
            );
            return;
        }
    }
}
