// Poll and vote ledgers - the source of truth for lifecycle state
pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::AppResult;
use models::*;

/// Poll ledger
///
/// Every status change goes through `update_poll_status`, a compare-and-swap
/// on (id, from). Implementations must fail with `LedgerError::Conflict` when
/// no row matched and `LedgerError::UnexpectedRowCount` when more than one did.
#[async_trait]
pub trait PollLedger: Send + Sync {
    /// Insert the poll and all of its options atomically
    async fn create_poll(&self, poll: &NewPoll) -> AppResult<Poll>;

    async fn get_poll(&self, poll_id: i64) -> AppResult<Poll>;

    async fn list_polls_by_status(&self, status: PollStatus) -> AppResult<Vec<Poll>>;

    /// Created polls whose expiry has passed
    async fn list_expired_polls(&self) -> AppResult<Vec<Poll>>;

    async fn update_poll_status(
        &self,
        poll_id: i64,
        from_status: PollStatus,
        to_status: PollStatus,
    ) -> AppResult<()>;

    async fn count_polls_by_status(&self) -> AppResult<PollStatusCounts>;
}

/// Vote ledger
#[async_trait]
pub trait VoteLedger: Send + Sync {
    async fn create_vote(&self, vote: &NewVote) -> AppResult<Vote>;

    async fn get_vote(&self, vote_id: i64) -> AppResult<Vote>;

    async fn get_vote_by_hash(&self, payment_hash: &str) -> AppResult<Vote>;

    async fn list_votes_by_status(&self, poll_id: i64, status: VoteStatus) -> AppResult<Vec<Vote>>;

    /// Created votes whose own expiry has passed
    async fn list_expired_votes(&self) -> AppResult<Vec<Vote>>;

    /// Created votes still inside their expiry, across every poll
    async fn list_pending_votes(&self) -> AppResult<Vec<Vote>>;

    /// Votes per option over every vote that was paid (paid, returned, settled)
    async fn count_paid_votes(&self, poll_id: i64) -> AppResult<HashMap<i64, i64>>;

    /// Sum of settle amounts over the poll's settled votes
    async fn sum_settled_amount(&self, poll_id: i64) -> AppResult<i64>;

    async fn update_vote_status(
        &self,
        vote_id: i64,
        from_status: VoteStatus,
        to_status: VoteStatus,
    ) -> AppResult<()>;

    /// Created → Paid, recording what the node reported
    async fn mark_paid(
        &self,
        vote_id: i64,
        settle_amount: i64,
        settle_index: Option<i64>,
    ) -> AppResult<()>;

    /// Raise the vote's settle index; never lowers it. Returns whether it moved.
    async fn advance_settle_index(&self, vote_id: i64, settle_index: i64) -> AppResult<bool>;

    /// Highest settle index recorded on any vote, 0 when none
    async fn latest_settle_index(&self) -> AppResult<i64>;
}

/// Maps the affected row count of a conditional write onto the CAS contract.
pub(crate) fn check_rows_affected(
    entity: &'static str,
    id: i64,
    expected: impl ToString,
    rows: u64,
) -> AppResult<()> {
    use crate::error::LedgerError;

    match rows {
        1 => Ok(()),
        0 => Err(LedgerError::Conflict {
            entity,
            id,
            expected: expected.to_string(),
        }
        .into()),
        rows => Err(LedgerError::UnexpectedRowCount { entity, id, rows }.into()),
    }
}

/// Reject transitions the state machines don't have before touching the store
pub(crate) fn validate_poll_transition(from: PollStatus, to: PollStatus) -> AppResult<()> {
    if !from.can_transition_to(to) {
        return Err(crate::error::AppError::Internal(format!(
            "invalid poll transition {} -> {}",
            from, to
        )));
    }
    Ok(())
}

pub(crate) fn validate_vote_transition(from: VoteStatus, to: VoteStatus) -> AppResult<()> {
    if !from.can_transition_to(to) {
        return Err(crate::error::AppError::Internal(format!(
            "invalid vote transition {} -> {}",
            from, to
        )));
    }
    Ok(())
}

/// Random positive 63-bit identifier
pub fn new_id() -> i64 {
    use rand::Rng;
    rand::rng().random_range(1..=i64::MAX)
}
