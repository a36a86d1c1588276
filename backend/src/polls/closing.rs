// Poll closing: settle pending votes, release or capture every paid vote,
// then pay the creator
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::PollService;
use crate::context::OpContext;
use crate::error::{AppError, AppResult, GatewayError};
use crate::gateway::InvoiceState;
use crate::ledger::models::{Poll, PollStatus, Vote, VoteStatus};
use crate::votes::resolve_pending_vote;

/// Closing passes per call before giving up. Every pass moves the poll
/// forward, so a healthy close needs at most five.
const MAX_CLOSE_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Reconciliation: only expired polls, never resumes PayingOut
    Expired,
    /// Operator: ignores expiry and resumes PayingOut. A PayingOut poll may
    /// still have a payment in flight from the pass that claimed it, and a
    /// second send is not known to be safe, so only resume once that pass
    /// has returned.
    Force,
}

/// Per-pass tally, logged
#[derive(Debug, Default)]
struct ReleaseSummary {
    returned: usize,
    settled: usize,
}

impl PollService {
    /// Drive a poll to PaidOut, resuming from whatever state a previous pass
    /// left it in. Losing a status race means another pass got there first;
    /// the poll is re-read and handled from its new state.
    #[instrument(skip(self, ctx))]
    pub async fn close_poll(&self, ctx: &OpContext, poll_id: i64, mode: CloseMode) -> AppResult<Poll> {
        let mut paying_out = false;

        for _ in 0..MAX_CLOSE_STEPS {
            let poll = ctx.run(self.polls.get_poll(poll_id)).await?;

            match poll.status {
                PollStatus::Created => {
                    if mode == CloseMode::Expired && !poll.is_expired_at(Utc::now()) {
                        debug!("Poll {} is still open", poll_id);
                        return Ok(poll);
                    }
                    self.advance(ctx, poll_id, PollStatus::Created, PollStatus::Closed)
                        .await?;
                }
                PollStatus::Closed => {
                    self.resolve_pending_votes(ctx, &poll).await?;
                    self.release_votes(ctx, &poll).await?;
                    self.advance(ctx, poll_id, PollStatus::Closed, PollStatus::Released)
                        .await?;
                }
                PollStatus::Released => {
                    let total = ctx.run(self.votes.sum_settled_amount(poll_id)).await?;
                    if total == 0 {
                        info!("Poll {} has no balance to pay out", poll_id);
                        self.advance(ctx, poll_id, PollStatus::Released, PollStatus::PaidOut)
                            .await?;
                    } else {
                        // claim the payout before sending
                        paying_out = self
                            .advance(ctx, poll_id, PollStatus::Released, PollStatus::PayingOut)
                            .await?;
                    }
                }
                PollStatus::PayingOut => {
                    if !paying_out && mode != CloseMode::Force {
                        warn!(
                            "Poll {} is paying out elsewhere or stuck; force close to resume",
                            poll_id
                        );
                        return Ok(poll);
                    }
                    self.pay_out(ctx, &poll).await?;
                    self.advance(ctx, poll_id, PollStatus::PayingOut, PollStatus::PaidOut)
                        .await?;
                }
                PollStatus::PaidOut => return Ok(poll),
            }
        }

        Err(AppError::Internal(format!(
            "poll {} did not settle after {} closing steps",
            poll_id, MAX_CLOSE_STEPS
        )))
    }

    /// Conditional poll transition. Conflict is reported as `false`: someone
    /// else already moved the poll.
    async fn advance(
        &self,
        ctx: &OpContext,
        poll_id: i64,
        from: PollStatus,
        to: PollStatus,
    ) -> AppResult<bool> {
        match ctx.run(self.polls.update_poll_status(poll_id, from, to)).await {
            Ok(()) => {
                info!("Poll {} {} -> {}", poll_id, from, to);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!("Poll {} already moved past {}", poll_id, from);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Decide every vote still waiting on payment before anything is counted.
    /// A paid invoice makes the vote Paid; otherwise the invoice is cancelled
    /// on the node so it can no longer be paid, and the vote expires.
    async fn resolve_pending_votes(&self, ctx: &OpContext, poll: &Poll) -> AppResult<()> {
        let pending = ctx
            .run(self.votes.list_votes_by_status(poll.id, VoteStatus::Created))
            .await?;

        for vote in &pending {
            let invoice = ctx.run(self.gateway.lookup_invoice(&vote.payment_hash)).await?;
            if !invoice.state.is_paid() && invoice.state != InvoiceState::Canceled {
                if let Err(e) = ctx
                    .run(self.gateway.cancel_hold_invoice(&vote.payment_hash))
                    .await
                {
                    self.confirm_invoice_state(ctx, vote, InvoiceState::Canceled, e)
                        .await?;
                }
            }

            let status = resolve_pending_vote(ctx, self.votes.as_ref(), vote, &invoice).await?;
            debug!("Pending vote {} of poll {} resolved as {}", vote.id, poll.id, status);
        }
        Ok(())
    }

    /// Refund or capture every Paid vote. Votes moved by an earlier pass are
    /// no longer Paid and are skipped. Any gateway failure aborts the pass.
    async fn release_votes(&self, ctx: &OpContext, poll: &Poll) -> AppResult<()> {
        let counts = ctx.run(self.votes.count_paid_votes(poll.id)).await?;
        let paid = ctx
            .run(self.votes.list_votes_by_status(poll.id, VoteStatus::Paid))
            .await?;

        let mut summary = ReleaseSummary::default();
        for vote in &paid {
            if poll.repay_scheme.should_refund(&counts, vote.option_id) {
                self.refund(ctx, vote).await?;
                summary.returned += 1;
            } else {
                self.capture(ctx, vote).await?;
                summary.settled += 1;
            }
        }

        info!(
            "Poll {} released under {}: {} returned, {} settled",
            poll.id, poll.repay_scheme, summary.returned, summary.settled
        );
        Ok(())
    }

    async fn refund(&self, ctx: &OpContext, vote: &Vote) -> AppResult<()> {
        if vote.preimage.is_none() {
            return Err(AppError::Internal(format!(
                "vote {} was paid with a plain invoice and cannot be refunded",
                vote.id
            )));
        }

        if let Err(e) = ctx
            .run(self.gateway.cancel_hold_invoice(&vote.payment_hash))
            .await
        {
            self.confirm_invoice_state(ctx, vote, InvoiceState::Canceled, e)
                .await?;
        }

        self.finish_vote(ctx, vote, VoteStatus::Returned).await
    }

    async fn capture(&self, ctx: &OpContext, vote: &Vote) -> AppResult<()> {
        // plain invoices were captured when paid
        if let Some(preimage) = &vote.preimage {
            if let Err(e) = ctx.run(self.gateway.settle_hold_invoice(preimage)).await {
                self.confirm_invoice_state(ctx, vote, InvoiceState::Settled, e)
                    .await?;
            }
        }

        self.finish_vote(ctx, vote, VoteStatus::Settled).await
    }

    /// After a failed cancel or settle, accept the failure only if the node
    /// already shows the invoice in the state we wanted.
    async fn confirm_invoice_state(
        &self,
        ctx: &OpContext,
        vote: &Vote,
        wanted: InvoiceState,
        cause: AppError,
    ) -> AppResult<()> {
        if matches!(cause, AppError::Cancelled | AppError::DeadlineExceeded) {
            return Err(cause);
        }

        match ctx.run(self.gateway.lookup_invoice(&vote.payment_hash)).await {
            Ok(invoice) if invoice.state == wanted => {
                debug!("Vote {} invoice already {:?}", vote.id, wanted);
                Ok(())
            }
            _ => Err(cause),
        }
    }

    async fn finish_vote(&self, ctx: &OpContext, vote: &Vote, to: VoteStatus) -> AppResult<()> {
        match ctx
            .run(self.votes.update_vote_status(vote.id, VoteStatus::Paid, to))
            .await
        {
            Err(e) if e.is_conflict() => {
                debug!("Vote {} already resolved", vote.id);
                Ok(())
            }
            other => other,
        }
    }

    /// One payment of everything captured to the creator's invoice. The
    /// total is recomputed from the ledger so a resumed pass pays the same.
    async fn pay_out(&self, ctx: &OpContext, poll: &Poll) -> AppResult<()> {
        let total = ctx.run(self.votes.sum_settled_amount(poll.id)).await?;
        info!("💸 Paying out {} sats for poll {}", total, poll.id);

        let response = ctx
            .run(self.gateway.send_payment(&poll.payout_invoice, total))
            .await?;
        if !response.payment_error.is_empty() {
            return Err(GatewayError::PaymentFailed(response.payment_error).into());
        }
        Ok(())
    }
}
