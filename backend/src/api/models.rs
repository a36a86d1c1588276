use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ValidationError;
use crate::ledger::models::{Poll, PollOption, PollStatus, PollStatusCounts, Vote, VoteStatus};
use crate::polls::PollRequest;
use crate::repayment::{RepayDetails, RepayScheme};

// ========== REQUEST MODELS ==========

/// Repay scheme as sent by a form: the numeric code or the name
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SchemeField {
    Code(i64),
    Name(String),
}

impl SchemeField {
    pub fn parse(&self) -> Result<RepayScheme, ValidationError> {
        match self {
            SchemeField::Code(code) => RepayScheme::from_code(*code),
            SchemeField::Name(name) => name.parse(),
        }
    }
}

/// Request to open a poll
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePollRequest {
    #[validate(length(min = 1, max = 500, message = "question must be 1-500 characters"))]
    pub question: String,

    #[validate(length(min = 1, max = 50, message = "between 1 and 50 options"))]
    pub options: Vec<String>,

    /// Price of one vote in satoshis
    #[validate(range(min = 1, message = "vote cost must be at least 1 sat"))]
    pub vote_sats: i64,

    #[validate(range(min = 60, max = 2592000, message = "expiry must be between a minute and 30 days"))]
    pub expiry_seconds: i64,

    pub repay_scheme: SchemeField,

    /// Zero-amount invoice the creator is paid through
    #[validate(length(min = 1, message = "payout invoice is required"))]
    pub payout_invoice: String,

    #[validate(email(message = "invalid email"))]
    pub email: Option<String>,
}

impl CreatePollRequest {
    pub fn into_poll_request(self) -> Result<PollRequest, ValidationError> {
        Ok(PollRequest {
            repay_scheme: self.repay_scheme.parse()?,
            question: self.question,
            options: self.options,
            vote_sats: self.vote_sats,
            expiry_seconds: self.expiry_seconds,
            payout_invoice: self.payout_invoice,
            email: self.email,
        })
    }
}

/// Request to vote for one option of an open poll
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CastVoteRequest {
    #[validate(range(min = 1))]
    pub poll_id: i64,
    #[validate(range(min = 1))]
    pub option_id: i64,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub poll_id: i64,
    pub question: String,
    pub options: Vec<OptionResponse>,
    pub vote_sats: i64,
    pub repay_scheme: RepayScheme,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct OptionResponse {
    pub option_id: i64,
    pub value: String,
}

impl From<&PollOption> for OptionResponse {
    fn from(option: &PollOption) -> Self {
        Self {
            option_id: option.id,
            value: option.value.clone(),
        }
    }
}

impl From<Poll> for PollResponse {
    fn from(poll: Poll) -> Self {
        Self {
            poll_id: poll.id,
            options: poll.options.iter().map(OptionResponse::from).collect(),
            question: poll.question,
            vote_sats: poll.vote_sats,
            repay_scheme: poll.repay_scheme,
            status: poll.status,
            created_at: poll.created_at,
            expires_at: poll.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PollListResponse {
    pub polls: Vec<PollResponse>,
    pub count: usize,
}

impl From<Vec<Poll>> for PollListResponse {
    fn from(polls: Vec<Poll>) -> Self {
        Self {
            count: polls.len(),
            polls: polls.into_iter().map(PollResponse::from).collect(),
        }
    }
}

/// Invoice the voter has to pay for the vote to count
#[derive(Debug, Serialize)]
pub struct VoteResponse {
    pub vote_id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub pay_req: String,
    pub payment_hash: String,
    pub status: VoteStatus,
    pub expires_at: DateTime<Utc>,
    pub settle_amount: Option<i64>,
}

impl From<Vote> for VoteResponse {
    fn from(vote: Vote) -> Self {
        Self {
            vote_id: vote.id,
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            pay_req: vote.pay_req,
            payment_hash: vote.payment_hash,
            status: vote.status,
            expires_at: vote.expires_at,
            settle_amount: vote.settle_amount,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OptionResult {
    pub option_id: i64,
    pub value: String,
    pub votes: i64,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub poll_id: i64,
    pub question: String,
    pub status: PollStatus,
    pub total_votes: i64,
    pub results: Vec<OptionResult>,
}

#[derive(Debug, Serialize)]
pub struct SchemesResponse {
    pub schemes: Vec<RepayDetails>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub polls: PollStatusCounts,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
}
