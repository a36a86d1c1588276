// Reconciliation: background drivers that push polls and votes forward
pub mod scheduler;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::OpContext;
use crate::error::{AppError, AppResult};
use crate::ledger::models::PollStatus;
use crate::ledger::{PollLedger, VoteLedger};
use crate::polls::{CloseMode, PollService};
use crate::votes::VoteService;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub poll_interval: Duration,
    pub vote_interval: Duration,
    pub stream_retry: Duration,
    /// Deadline for one poll close or one vote expiry
    pub pass_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            vote_interval: Duration::from_secs(300),
            stream_retry: Duration::from_secs(10),
            pass_timeout: Duration::from_secs(300),
        }
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub failed: usize,
}

pub struct Reconciler {
    polls: Arc<PollService>,
    votes: Arc<VoteService>,
    poll_ledger: Arc<dyn PollLedger>,
    vote_ledger: Arc<dyn VoteLedger>,
    settings: ReconcilerSettings,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        polls: Arc<PollService>,
        votes: Arc<VoteService>,
        poll_ledger: Arc<dyn PollLedger>,
        vote_ledger: Arc<dyn VoteLedger>,
        settings: ReconcilerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            polls,
            votes,
            poll_ledger,
            vote_ledger,
            settings,
            shutdown,
        }
    }

    /// Start the poll-expiry, vote-expiry and settlement-stream loops. They
    /// run until the shutdown token is cancelled. Votes left waiting on
    /// payment by a previous run are watched again.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "⏰ Starting reconciliation loops (polls every {:?}, votes every {:?})",
            self.settings.poll_interval, self.settings.vote_interval
        );

        let resume = self.clone();
        vec![
            tokio::spawn(async move {
                match resume.resume_subscriptions().await {
                    Ok(0) => {}
                    Ok(n) => info!("🔁 Resumed {} vote subscriptions", n),
                    Err(e) => error!("❌ Failed to resume vote subscriptions: {}", e),
                }
            }),
            tokio::spawn(scheduler::run_poll_expiry_loop(self.clone())),
            tokio::spawn(scheduler::run_vote_expiry_loop(self.clone())),
            tokio::spawn(stream::run_settlement_stream(self.clone())),
        ]
    }

    fn pass_ctx(&self) -> OpContext {
        OpContext::new(self.shutdown.child_token()).with_timeout(self.settings.pass_timeout)
    }

    pub async fn resume_subscriptions(&self) -> AppResult<usize> {
        self.votes.resume_subscriptions(&self.pass_ctx()).await
    }

    /// Close every expired poll and resume any left Closed or Released.
    /// A failing poll is logged and does not hold up the others.
    pub async fn close_expired_polls(&self) -> AppResult<PassReport> {
        let ctx = self.pass_ctx();

        let mut candidates = ctx.run(self.poll_ledger.list_expired_polls()).await?;
        for status in [PollStatus::Closed, PollStatus::Released] {
            candidates.extend(ctx.run(self.poll_ledger.list_polls_by_status(status)).await?);
        }

        let mut report = PassReport::default();
        for poll in candidates {
            match self
                .polls
                .close_poll(&self.pass_ctx(), poll.id, CloseMode::Expired)
                .await
            {
                Ok(_) => report.processed += 1,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to close poll {}: {}", poll.id, e);
                }
            }
        }

        let stuck = ctx
            .run(self.poll_ledger.list_polls_by_status(PollStatus::PayingOut))
            .await?;
        for poll in &stuck {
            warn!("Poll {} is stuck in paying_out; needs a force close", poll.id);
        }

        let counts = ctx.run(self.poll_ledger.count_polls_by_status()).await?;
        debug!("Poll status counts: {:?}", counts);

        Ok(report)
    }

    /// Resolve every Created vote past its expiry: paid invoices win,
    /// everything else expires.
    pub async fn expire_votes(&self) -> AppResult<PassReport> {
        let expired = self
            .pass_ctx()
            .run(self.vote_ledger.list_expired_votes())
            .await?;

        let mut report = PassReport::default();
        for vote in &expired {
            match self.votes.expire_vote(&self.pass_ctx(), vote).await {
                Ok(status) => {
                    report.processed += 1;
                    debug!("Vote {} resolved as {}", vote.id, status);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to expire vote {}: {}", vote.id, e);
                }
            }
        }

        Ok(report)
    }
}
