// Vote settlement: invoice minting, payment tracking, results
pub mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::context::OpContext;
use crate::error::{AppResult, ValidationError};
use crate::gateway::{InvoiceStream, InvoiceUpdate, PaymentGateway};
use crate::ledger::models::{NewVote, Poll, Vote, VoteStatus};
use crate::ledger::{new_id, PollLedger, VoteLedger};

pub use subscription::MAX_SUBSCRIPTION_EVENTS;

/// Parameters of `create_vote`
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub poll_id: i64,
    pub option_id: i64,
    pub amount: i64,
    pub expiry_seconds: i64,
    pub memo: String,
}

/// A persisted vote and the task watching its invoice
#[derive(Debug)]
pub struct CreatedVote {
    pub vote: Vote,
    pub subscription: JoinHandle<()>,
}

/// A poll with its paid-vote count per option. Every option has an entry.
#[derive(Debug, Clone)]
pub struct PollResults {
    pub poll: Poll,
    pub counts: HashMap<i64, i64>,
}

/// What a global-stream settlement event did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Not ours, or carries no settle index
    Ignored,
    MarkedPaid,
    Advanced,
    Duplicate,
}

pub struct VoteService {
    polls: Arc<dyn PollLedger>,
    votes: Arc<dyn VoteLedger>,
    gateway: Arc<dyn PaymentGateway>,
    shutdown: CancellationToken,
}

/// Resolve the vote behind a paid invoice and move it Created → Paid.
/// Conflict means it was already moved.
pub(crate) async fn mark_invoice_paid(
    ctx: &OpContext,
    votes: &dyn VoteLedger,
    update: &InvoiceUpdate,
) -> AppResult<()> {
    let vote = ctx.run(votes.get_vote_by_hash(&update.payment_hash)).await?;
    ctx.run(votes.mark_paid(vote.id, update.amount_paid_sat, update.settle_index()))
        .await
}

/// Settle a Created vote against a fresh look at its invoice: a paid invoice
/// makes it Paid, anything else Expired. A lost race returns whatever status
/// the winner left behind.
pub(crate) async fn resolve_pending_vote(
    ctx: &OpContext,
    votes: &dyn VoteLedger,
    vote: &Vote,
    invoice: &InvoiceUpdate,
) -> AppResult<VoteStatus> {
    let result = if invoice.state.is_paid() {
        mark_invoice_paid(ctx, votes, invoice)
            .await
            .map(|_| VoteStatus::Paid)
    } else {
        ctx.run(votes.update_vote_status(vote.id, VoteStatus::Created, VoteStatus::Expired))
            .await
            .map(|_| VoteStatus::Expired)
    };

    match result {
        Ok(status) => Ok(status),
        Err(e) if e.is_conflict() => Ok(ctx.run(votes.get_vote(vote.id)).await?.status),
        Err(e) => Err(e),
    }
}

impl VoteService {
    pub fn new(
        polls: Arc<dyn PollLedger>,
        votes: Arc<dyn VoteLedger>,
        gateway: Arc<dyn PaymentGateway>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            polls,
            votes,
            gateway,
            shutdown,
        }
    }

    /// Mint an invoice for a vote, persist it, and start watching it.
    ///
    /// Polls that may refund get hold invoices; the rest get plain ones.
    /// The vote's expiry never outlives the poll.
    #[instrument(skip(self, ctx, request), fields(poll_id = request.poll_id, option_id = request.option_id))]
    pub async fn create_vote(&self, ctx: &OpContext, request: VoteRequest) -> AppResult<CreatedVote> {
        if request.amount <= 0 {
            return Err(ValidationError::InvalidInput("vote amount must be positive".into()).into());
        }
        if request.expiry_seconds <= 0 {
            return Err(ValidationError::InvalidInput("vote expiry must be positive".into()).into());
        }

        let poll = ctx.run(self.polls.get_poll(request.poll_id)).await?;
        let now = Utc::now();
        if !poll.accepts_votes_at(now) {
            return Err(ValidationError::PollNotOpen(poll.id).into());
        }
        if poll.option(request.option_id).is_none() {
            return Err(ValidationError::UnknownOption {
                poll_id: poll.id,
                option_id: request.option_id,
            }
            .into());
        }

        let remaining = (poll.expires_at - now).num_seconds().max(1);
        let expiry_seconds = request.expiry_seconds.min(remaining);

        let (pay_req, payment_hash, preimage) = if poll.repay_scheme.may_refund() {
            let invoice = ctx
                .run(self.gateway.add_hold_invoice(request.amount, expiry_seconds, &request.memo))
                .await?;
            (invoice.pay_req, invoice.payment_hash, Some(invoice.preimage))
        } else {
            let invoice = ctx
                .run(self.gateway.add_invoice(request.amount, expiry_seconds, &request.memo))
                .await?;
            (invoice.pay_req, invoice.payment_hash, None)
        };

        let new_vote = NewVote {
            id: new_id(),
            poll_id: poll.id,
            option_id: request.option_id,
            expiry_seconds,
            pay_req,
            payment_hash,
            preimage,
        };

        let vote = match ctx.run(self.votes.create_vote(&new_vote)).await {
            Ok(vote) => vote,
            Err(e) => {
                // the node-side invoice expires on its own
                error!(
                    "Invoice {} orphaned, vote not persisted: {}",
                    new_vote.payment_hash, e
                );
                return Err(e);
            }
        };

        info!("🗳️  Created vote {} for poll {}", vote.id, poll.id);

        let subscription = subscription::spawn_subscription(
            self.votes.clone(),
            self.gateway.clone(),
            self.shutdown.child_token(),
            vote.id,
            vote.payment_hash.clone(),
        );

        Ok(CreatedVote { vote, subscription })
    }

    /// Vote on behalf of a visitor: the poll decides price, expiry and memo
    pub async fn cast_vote(&self, ctx: &OpContext, poll_id: i64, option_id: i64) -> AppResult<CreatedVote> {
        let poll = ctx.run(self.polls.get_poll(poll_id)).await?;
        let now = Utc::now();
        if !poll.accepts_votes_at(now) {
            return Err(ValidationError::PollNotOpen(poll_id).into());
        }
        let option = poll.option(option_id).ok_or(ValidationError::UnknownOption {
            poll_id,
            option_id,
        })?;

        let request = VoteRequest {
            poll_id,
            option_id,
            amount: poll.vote_sats,
            expiry_seconds: (poll.expires_at - now).num_seconds().max(1),
            memo: format!("Vote: {} for poll: {}", option.value, poll.question),
        };

        self.create_vote(ctx, request).await
    }

    pub async fn lookup_vote(&self, ctx: &OpContext, vote_id: i64) -> AppResult<Vote> {
        ctx.run(self.votes.get_vote(vote_id)).await
    }

    /// Paid votes per option, with every option of the poll present
    pub async fn get_results(&self, ctx: &OpContext, poll_id: i64) -> AppResult<PollResults> {
        let poll = ctx.run(self.polls.get_poll(poll_id)).await?;
        let paid = ctx.run(self.votes.count_paid_votes(poll_id)).await?;

        let counts = poll
            .options
            .iter()
            .map(|o| (o.id, paid.get(&o.id).copied().unwrap_or(0)))
            .collect();
        Ok(PollResults { poll, counts })
    }

    /// Settled invoices after `settle_index`, then live ones
    pub async fn subscribe_settlements(
        &self,
        ctx: &OpContext,
        settle_index: i64,
    ) -> AppResult<InvoiceStream> {
        ctx.run(self.gateway.subscribe_invoices(settle_index)).await
    }

    pub async fn mark_invoice_paid(&self, ctx: &OpContext, update: &InvoiceUpdate) -> AppResult<()> {
        mark_invoice_paid(ctx, self.votes.as_ref(), update).await
    }

    /// Apply one event of the global settlement stream. Duplicates are no-ops.
    pub async fn apply_settlement(
        &self,
        ctx: &OpContext,
        update: &InvoiceUpdate,
    ) -> AppResult<SettlementOutcome> {
        let Some(settle_index) = update.settle_index() else {
            return Ok(SettlementOutcome::Ignored);
        };

        let vote = match ctx.run(self.votes.get_vote_by_hash(&update.payment_hash)).await {
            Ok(vote) => vote,
            Err(e) if e.is_not_found() => {
                debug!("Settled invoice {} is not a vote", update.payment_hash);
                return Ok(SettlementOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };

        if vote.status == VoteStatus::Created && update.state.is_paid() {
            match ctx
                .run(self.votes.mark_paid(vote.id, update.amount_paid_sat, Some(settle_index)))
                .await
            {
                Ok(()) => return Ok(SettlementOutcome::MarkedPaid),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        if ctx.run(self.votes.advance_settle_index(vote.id, settle_index)).await? {
            Ok(SettlementOutcome::Advanced)
        } else {
            Ok(SettlementOutcome::Duplicate)
        }
    }

    /// Resolve a Created vote past its expiry. An invoice found paid wins
    /// over expiry. Returns the vote's resulting status.
    #[instrument(skip(self, ctx, vote), fields(vote_id = vote.id))]
    pub async fn expire_vote(&self, ctx: &OpContext, vote: &Vote) -> AppResult<VoteStatus> {
        let invoice = ctx.run(self.gateway.lookup_invoice(&vote.payment_hash)).await?;
        resolve_pending_vote(ctx, self.votes.as_ref(), vote, &invoice).await
    }

    /// Watch again every vote still waiting on payment. Subscriptions die
    /// with the process, so this runs once at startup.
    pub async fn resume_subscriptions(&self, ctx: &OpContext) -> AppResult<usize> {
        let pending = ctx.run(self.votes.list_pending_votes()).await?;
        for vote in &pending {
            subscription::spawn_subscription(
                self.votes.clone(),
                self.gateway.clone(),
                self.shutdown.child_token(),
                vote.id,
                vote.payment_hash.clone(),
            );
        }
        Ok(pending.len())
    }
}
