// Poll creation, lookup and closing
pub mod closing;

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::context::OpContext;
use crate::error::{AppError, AppResult, GatewayError, ValidationError};
use crate::gateway::PaymentGateway;
use crate::ledger::models::{NewPoll, Poll, PollStatus, PollStatusCounts};
use crate::ledger::{new_id, PollLedger, VoteLedger};
use crate::repayment::{RepayDetails, RepayScheme};

pub use closing::CloseMode;

/// Seconds a payout invoice must stay valid past the poll's expiry
pub const DEFAULT_PAYOUT_EXPIRY_BUFFER_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub payout_expiry_buffer_secs: i64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            payout_expiry_buffer_secs: DEFAULT_PAYOUT_EXPIRY_BUFFER_SECS,
        }
    }
}

/// Parameters of `create_poll`
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub question: String,
    pub options: Vec<String>,
    pub vote_sats: i64,
    pub expiry_seconds: i64,
    pub repay_scheme: RepayScheme,
    pub payout_invoice: String,
    pub email: Option<String>,
}

pub struct PollService {
    polls: Arc<dyn PollLedger>,
    votes: Arc<dyn VoteLedger>,
    gateway: Arc<dyn PaymentGateway>,
    settings: PollSettings,
}

impl PollService {
    pub fn new(
        polls: Arc<dyn PollLedger>,
        votes: Arc<dyn VoteLedger>,
        gateway: Arc<dyn PaymentGateway>,
        settings: PollSettings,
    ) -> Self {
        Self {
            polls,
            votes,
            gateway,
            settings,
        }
    }

    #[instrument(skip(self, ctx, request), fields(scheme = %request.repay_scheme))]
    pub async fn create_poll(&self, ctx: &OpContext, request: PollRequest) -> AppResult<Poll> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(ValidationError::InvalidInput("question is empty".into()).into());
        }
        if request.vote_sats <= 0 {
            return Err(ValidationError::InvalidInput("vote cost must be positive".into()).into());
        }
        if request.expiry_seconds <= 0 {
            return Err(ValidationError::InvalidInput("poll expiry must be positive".into()).into());
        }

        let options: Vec<String> = request
            .options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if options.is_empty() {
            return Err(ValidationError::NoOptions.into());
        }

        self.validate_payout(ctx, &request.payout_invoice, request.expiry_seconds)
            .await?;

        let new_poll = NewPoll {
            id: new_id(),
            question,
            options,
            vote_sats: request.vote_sats,
            expiry_seconds: request.expiry_seconds,
            repay_scheme: request.repay_scheme,
            payout_invoice: request.payout_invoice,
            email: request
                .email
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
        };

        let poll = ctx.run(self.polls.create_poll(&new_poll)).await?;
        info!(
            "📊 Created poll {} with {} options, closes at {}",
            poll.id,
            poll.options.len(),
            poll.expires_at
        );
        Ok(poll)
    }

    /// The payout invoice must leave the amount to us and stay payable until
    /// well after the poll closes.
    pub async fn validate_payout(
        &self,
        ctx: &OpContext,
        pay_req: &str,
        expiry_seconds: i64,
    ) -> AppResult<()> {
        if pay_req.trim().is_empty() {
            return Err(ValidationError::MalformedInvoice("payout invoice is empty".into()).into());
        }

        let decoded = match ctx.run(self.gateway.decode_payment_request(pay_req)).await {
            Ok(decoded) => decoded,
            Err(AppError::Gateway(GatewayError::Rpc { message, .. })) => {
                return Err(ValidationError::MalformedInvoice(message).into())
            }
            Err(e) => return Err(e),
        };

        // validity left from now; invoices without a timestamp count from now
        let remaining = if decoded.timestamp > 0 {
            decoded.timestamp + decoded.expiry - Utc::now().timestamp()
        } else {
            decoded.expiry
        };
        let required = expiry_seconds + self.settings.payout_expiry_buffer_secs;
        if remaining < required {
            return Err(ValidationError::PayoutExpiry {
                expiry: remaining,
                required,
            }
            .into());
        }

        if decoded.num_satoshis != 0 {
            return Err(ValidationError::NonZeroInvoice(decoded.num_satoshis).into());
        }

        Ok(())
    }

    pub async fn lookup_poll(&self, ctx: &OpContext, poll_id: i64) -> AppResult<Poll> {
        ctx.run(self.polls.get_poll(poll_id)).await
    }

    /// Polls still taking votes
    pub async fn list_active_polls(&self, ctx: &OpContext) -> AppResult<Vec<Poll>> {
        ctx.run(self.polls.list_polls_by_status(PollStatus::Created))
            .await
    }

    /// Every poll past Created, most recently closed first
    pub async fn list_inactive_polls(&self, ctx: &OpContext) -> AppResult<Vec<Poll>> {
        let mut inactive = Vec::new();
        for status in PollStatus::all() {
            if status == PollStatus::Created {
                continue;
            }
            inactive.extend(ctx.run(self.polls.list_polls_by_status(status)).await?);
        }
        inactive.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        Ok(inactive)
    }

    pub fn list_repay_schemes(&self) -> Vec<RepayDetails> {
        RepayScheme::all().iter().map(|s| s.details()).collect()
    }

    pub async fn count_polls_by_status(&self, ctx: &OpContext) -> AppResult<PollStatusCounts> {
        ctx.run(self.polls.count_polls_by_status()).await
    }

    /// Close a poll now, whatever its expiry, and resume a payout left in
    /// PayingOut. Only operators should reach this, and only once the pass
    /// that claimed PayingOut has finished: resuming sends the payment again.
    #[instrument(skip(self, ctx))]
    pub async fn force_close_poll(&self, ctx: &OpContext, poll_id: i64) -> AppResult<Poll> {
        info!("Force closing poll {}", poll_id);
        self.close_poll(ctx, poll_id, CloseMode::Force).await
    }
}
