use super::models::*;
use super::{
    check_rows_affected, new_id, validate_poll_transition, validate_vote_transition, PollLedger,
    VoteLedger,
};
use crate::error::{AppError, AppResult, LedgerError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local ledger with the same compare-and-swap contract as the
/// Postgres one. Used for `LEDGER_BACKEND=memory` and in tests.
#[derive(Default)]
pub struct InMemoryLedger {
    polls: RwLock<HashMap<i64, Poll>>,
    votes: RwLock<HashMap<i64, Vote>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a poll's expiry. Lets tests drive the expiry loops without waiting.
    #[cfg(test)]
    pub async fn set_poll_expiry(&self, poll_id: i64, expires_at: chrono::DateTime<Utc>) {
        if let Some(poll) = self.polls.write().await.get_mut(&poll_id) {
            poll.expires_at = expires_at;
        }
    }

    #[cfg(test)]
    pub async fn set_vote_expiry(&self, vote_id: i64, expires_at: chrono::DateTime<Utc>) {
        if let Some(vote) = self.votes.write().await.get_mut(&vote_id) {
            vote.expires_at = expires_at;
        }
    }
}

#[async_trait]
impl PollLedger for InMemoryLedger {
    async fn create_poll(&self, poll: &NewPoll) -> AppResult<Poll> {
        let created_at = Utc::now();
        let options = poll
            .options
            .iter()
            .map(|value| PollOption {
                id: new_id(),
                poll_id: poll.id,
                value: value.clone(),
            })
            .collect();

        let stored = Poll {
            id: poll.id,
            question: poll.question.clone(),
            options,
            vote_sats: poll.vote_sats,
            created_at,
            expires_at: created_at + Duration::seconds(poll.expiry_seconds),
            expiry_seconds: poll.expiry_seconds,
            repay_scheme: poll.repay_scheme,
            payout_invoice: poll.payout_invoice.clone(),
            email: poll.email.clone(),
            status: PollStatus::Created,
        };

        let mut polls = self.polls.write().await;
        if polls.contains_key(&poll.id) {
            return Err(AppError::Internal(format!("poll {} already exists", poll.id)));
        }
        polls.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_poll(&self, poll_id: i64) -> AppResult<Poll> {
        self.polls
            .read()
            .await
            .get(&poll_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("poll", poll_id))
    }

    async fn list_polls_by_status(&self, status: PollStatus) -> AppResult<Vec<Poll>> {
        let polls = self.polls.read().await;
        let mut matching: Vec<Poll> = polls
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.expires_at);
        Ok(matching)
    }

    async fn list_expired_polls(&self) -> AppResult<Vec<Poll>> {
        let now = Utc::now();
        let polls = self.polls.read().await;
        let mut expired: Vec<Poll> = polls
            .values()
            .filter(|p| p.status == PollStatus::Created && p.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|p| p.expires_at);
        Ok(expired)
    }

    async fn update_poll_status(
        &self,
        poll_id: i64,
        from_status: PollStatus,
        to_status: PollStatus,
    ) -> AppResult<()> {
        validate_poll_transition(from_status, to_status)?;

        let mut polls = self.polls.write().await;
        let rows = match polls.get_mut(&poll_id) {
            Some(poll) if poll.status == from_status => {
                poll.status = to_status;
                1
            }
            _ => 0,
        };
        check_rows_affected("poll", poll_id, from_status, rows)
    }

    async fn count_polls_by_status(&self) -> AppResult<PollStatusCounts> {
        let mut counts = PollStatusCounts::default();
        for poll in self.polls.read().await.values() {
            counts.add(poll.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl VoteLedger for InMemoryLedger {
    async fn create_vote(&self, vote: &NewVote) -> AppResult<Vote> {
        let created_at = Utc::now();
        let mut votes = self.votes.write().await;

        if votes.values().any(|v| v.payment_hash == vote.payment_hash) {
            return Err(LedgerError::DuplicatePaymentHash(vote.payment_hash.clone()).into());
        }

        let stored = Vote {
            id: vote.id,
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            created_at,
            expires_at: created_at + Duration::seconds(vote.expiry_seconds),
            pay_req: vote.pay_req.clone(),
            payment_hash: vote.payment_hash.clone(),
            preimage: vote.preimage.clone(),
            settle_index: None,
            settle_amount: None,
            status: VoteStatus::Created,
        };
        votes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_vote(&self, vote_id: i64) -> AppResult<Vote> {
        self.votes
            .read()
            .await
            .get(&vote_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("vote", vote_id))
    }

    async fn get_vote_by_hash(&self, payment_hash: &str) -> AppResult<Vote> {
        self.votes
            .read()
            .await
            .values()
            .find(|v| v.payment_hash == payment_hash)
            .cloned()
            .ok_or_else(|| AppError::not_found("vote", payment_hash))
    }

    async fn list_votes_by_status(&self, poll_id: i64, status: VoteStatus) -> AppResult<Vec<Vote>> {
        let votes = self.votes.read().await;
        let mut matching: Vec<Vote> = votes
            .values()
            .filter(|v| v.poll_id == poll_id && v.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|v| v.created_at);
        Ok(matching)
    }

    async fn list_expired_votes(&self) -> AppResult<Vec<Vote>> {
        let now = Utc::now();
        let votes = self.votes.read().await;
        Ok(votes
            .values()
            .filter(|v| v.status == VoteStatus::Created && v.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn list_pending_votes(&self) -> AppResult<Vec<Vote>> {
        let now = Utc::now();
        let votes = self.votes.read().await;
        Ok(votes
            .values()
            .filter(|v| v.status == VoteStatus::Created && !v.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn count_paid_votes(&self, poll_id: i64) -> AppResult<HashMap<i64, i64>> {
        let mut counts = HashMap::new();
        for vote in self.votes.read().await.values() {
            if vote.poll_id == poll_id && vote.status.was_paid() {
                *counts.entry(vote.option_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn sum_settled_amount(&self, poll_id: i64) -> AppResult<i64> {
        Ok(self
            .votes
            .read()
            .await
            .values()
            .filter(|v| v.poll_id == poll_id && v.status == VoteStatus::Settled)
            .filter_map(|v| v.settle_amount)
            .sum())
    }

    async fn update_vote_status(
        &self,
        vote_id: i64,
        from_status: VoteStatus,
        to_status: VoteStatus,
    ) -> AppResult<()> {
        validate_vote_transition(from_status, to_status)?;

        let mut votes = self.votes.write().await;
        let rows = match votes.get_mut(&vote_id) {
            Some(vote) if vote.status == from_status => {
                vote.status = to_status;
                1
            }
            _ => 0,
        };
        check_rows_affected("vote", vote_id, from_status, rows)
    }

    async fn mark_paid(
        &self,
        vote_id: i64,
        settle_amount: i64,
        settle_index: Option<i64>,
    ) -> AppResult<()> {
        let mut votes = self.votes.write().await;
        let rows = match votes.get_mut(&vote_id) {
            Some(vote) if vote.status == VoteStatus::Created => {
                vote.status = VoteStatus::Paid;
                vote.settle_amount = Some(settle_amount);
                if let Some(index) = settle_index {
                    vote.settle_index = Some(vote.settle_index.unwrap_or(0).max(index));
                }
                1
            }
            _ => 0,
        };
        check_rows_affected("vote", vote_id, VoteStatus::Created, rows)
    }

    async fn advance_settle_index(&self, vote_id: i64, settle_index: i64) -> AppResult<bool> {
        let mut votes = self.votes.write().await;
        match votes.get_mut(&vote_id) {
            Some(vote) if vote.settle_index.map_or(true, |current| current < settle_index) => {
                vote.settle_index = Some(settle_index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn latest_settle_index(&self) -> AppResult<i64> {
        Ok(self
            .votes
            .read()
            .await
            .values()
            .filter_map(|v| v.settle_index)
            .max()
            .unwrap_or(0))
    }
}
