// Global settlement stream, resumed from the highest settle index we stored
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info};

use super::Reconciler;
use crate::context::OpContext;
use crate::error::{AppError, AppResult};
use crate::votes::SettlementOutcome;

pub(crate) async fn run_settlement_stream(reconciler: Arc<Reconciler>) {
    loop {
        match consume(&reconciler).await {
            Ok(()) => info!("Settlement stream ended, reconnecting"),
            Err(AppError::Cancelled) => {
                info!("✓ Settlement stream stopped");
                return;
            }
            Err(e) => error!("❌ Settlement stream failed: {}", e),
        }

        tokio::select! {
            _ = reconciler.shutdown.cancelled() => {
                info!("✓ Settlement stream stopped");
                return;
            }
            _ = tokio::time::sleep(reconciler.settings.stream_retry) => {}
        }
    }
}

/// One subscription, from the stored watermark until the stream ends or fails
async fn consume(reconciler: &Reconciler) -> AppResult<()> {
    let ctx = OpContext::new(reconciler.shutdown.child_token());

    let from = ctx.run(reconciler.vote_ledger.latest_settle_index()).await?;
    let mut stream = reconciler.votes.subscribe_settlements(&ctx, from).await?;
    info!("📡 Settlement stream resumed from index {}", from);

    loop {
        let next = tokio::select! {
            _ = ctx.token().cancelled() => return Err(AppError::Cancelled),
            next = stream.next() => next,
        };

        let update = match next {
            Some(update) => update?,
            None => return Ok(()),
        };

        let outcome = reconciler.votes.apply_settlement(&ctx, &update).await?;
        if outcome == SettlementOutcome::MarkedPaid {
            info!("⚡ Invoice {} settled", update.payment_hash);
        } else {
            debug!("Settlement event {}: {:?}", update.payment_hash, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{InvoiceState, InvoiceUpdate};
    use crate::ledger::models::VoteStatus;
    use crate::ledger::VoteLedger;
    use crate::repayment::RepayScheme;
    use crate::settlement::ReconcilerSettings;
    use crate::testing::Harness;
    use std::time::Duration;

    fn settled(hash: &str, settle_index: i64) -> InvoiceUpdate {
        InvoiceUpdate {
            payment_hash: hash.to_string(),
            state: InvoiceState::Settled,
            amount_paid_sat: 10,
            settle_index,
        }
    }

    async fn wait_for_status(h: &Harness, vote_id: i64, status: VoteStatus) {
        for _ in 0..200 {
            if h.ledger_vote(vote_id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("vote {} never reached {}", vote_id, status);
    }

    #[tokio::test]
    async fn test_stream_resumes_from_watermark() {
        let h = Harness::new();
        let reconciler = Arc::new(Reconciler::new(
            h.polls.clone(),
            h.votes.clone(),
            h.ledger.clone(),
            h.ledger.clone(),
            ReconcilerSettings {
                stream_retry: Duration::from_millis(10),
                ..ReconcilerSettings::default()
            },
            h.shutdown.clone(),
        ));

        let poll = h.poll(RepayScheme::None, &["A"]).await;
        let earlier = h.paid_vote(&poll, 0).await;
        h.ledger.advance_settle_index(earlier.id, 5).await.unwrap();

        let created = h
            .votes
            .cast_vote(&h.ctx(), poll.id, poll.options[0].id)
            .await
            .unwrap();
        created.subscription.abort();

        let handle = tokio::spawn(run_settlement_stream(reconciler));

        assert_eq!(h.gateway.wait_for_global_subscriptions(1).await, vec![5]);
        assert!(h.gateway.push_global(Ok(settled(&created.vote.payment_hash, 6))));
        wait_for_status(&h, created.vote.id, VoteStatus::Paid).await;

        // a broken stream is re-opened from the new watermark
        assert!(h.gateway.push_global(Err(GatewayError::StreamClosed.into())));
        assert_eq!(h.gateway.wait_for_global_subscriptions(2).await, vec![5, 6]);

        // replays are harmless
        assert!(h.gateway.push_global(Ok(settled(&created.vote.payment_hash, 6))));
        assert!(h.gateway.push_global(Ok(settled("00", 7))));

        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stream loop did not stop")
            .unwrap();

        let vote = h.ledger_vote(created.vote.id).await;
        assert_eq!(vote.status, VoteStatus::Paid);
        assert_eq!(vote.settle_index, Some(6));
        assert_eq!(h.ledger.latest_settle_index().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_retried() {
        let h = Harness::new();
        let reconciler = Arc::new(Reconciler::new(
            h.polls.clone(),
            h.votes.clone(),
            h.ledger.clone(),
            h.ledger.clone(),
            ReconcilerSettings {
                stream_retry: Duration::from_millis(10),
                ..ReconcilerSettings::default()
            },
            h.shutdown.clone(),
        ));

        h.gateway.fail_subscribe_invoices(true);
        let handle = tokio::spawn(run_settlement_stream(reconciler));
        assert!(h.gateway.wait_for_global_subscriptions(3).await.len() >= 3);

        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stream loop did not stop")
            .unwrap();
    }
}
