use super::models::*;
use super::{
    check_rows_affected, new_id, validate_poll_transition, validate_vote_transition, PollLedger,
    VoteLedger,
};
use crate::error::{AppError, AppResult, LedgerError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

const POLL_COLUMNS: &str = "id, question, vote_sats, created_at, expires_at, expiry_seconds, \
     repay_scheme, payout_invoice, email, status";

const VOTE_COLUMNS: &str = "id, poll_id, option_id, created_at, expires_at, pay_req, \
     payment_hash, preimage, settle_index, settle_amount, status";

/// Postgres ledger - THE source of truth for poll and vote state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach options to a batch of poll rows with a single query
    async fn with_options(&self, rows: Vec<PollRow>) -> AppResult<Vec<Poll>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let options = sqlx::query_as::<_, PollOption>(
            r#"
            SELECT id, poll_id, value
            FROM poll_options
            WHERE poll_id = ANY($1)
            ORDER BY poll_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_poll: HashMap<i64, Vec<PollOption>> = HashMap::new();
        for option in options {
            by_poll.entry(option.poll_id).or_default().push(option);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let options = by_poll.remove(&row.id).unwrap_or_default();
                row.into_poll(options)
            })
            .collect())
    }

    async fn list_polls(&self, query: &str, status: PollStatus) -> AppResult<Vec<Poll>> {
        let rows = sqlx::query_as::<_, PollRow>(query)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        self.with_options(rows).await
    }

    async fn list_votes(&self, query: &str, status: VoteStatus, poll_id: Option<i64>) -> AppResult<Vec<Vote>> {
        let mut q = sqlx::query_as::<_, VoteRow>(query).bind(status);
        if let Some(poll_id) = poll_id {
            q = q.bind(poll_id);
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Vote::from).collect())
    }
}

fn map_unique_violation(err: sqlx::Error, payment_hash: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LedgerError::DuplicatePaymentHash(payment_hash.to_string()).into()
        }
        _ => AppError::Database(err),
    }
}

#[async_trait]
impl PollLedger for LedgerRepository {
    // ========== POLL OPERATIONS ==========

    async fn create_poll(&self, poll: &NewPoll) -> AppResult<Poll> {
        let created_at = Utc::now();
        let expires_at = created_at + Duration::seconds(poll.expiry_seconds);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PollRow>(&format!(
            r#"
            INSERT INTO polls (
                id, question, vote_sats, created_at, expires_at, expiry_seconds,
                repay_scheme, payout_invoice, email, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {POLL_COLUMNS}
            "#
        ))
        .bind(poll.id)
        .bind(&poll.question)
        .bind(poll.vote_sats)
        .bind(created_at)
        .bind(expires_at)
        .bind(poll.expiry_seconds)
        .bind(poll.repay_scheme)
        .bind(&poll.payout_invoice)
        .bind(&poll.email)
        .bind(PollStatus::Created)
        .fetch_one(&mut *tx)
        .await?;

        let mut options = Vec::with_capacity(poll.options.len());
        for (position, value) in poll.options.iter().enumerate() {
            let option = sqlx::query_as::<_, PollOption>(
                r#"
                INSERT INTO poll_options (id, poll_id, position, value)
                VALUES ($1, $2, $3, $4)
                RETURNING id, poll_id, value
                "#,
            )
            .bind(new_id())
            .bind(poll.id)
            .bind(position as i32)
            .bind(value)
            .fetch_one(&mut *tx)
            .await?;
            options.push(option);
        }

        tx.commit().await?;

        Ok(row.into_poll(options))
    }

    async fn get_poll(&self, poll_id: i64) -> AppResult<Poll> {
        let row = sqlx::query_as::<_, PollRow>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("poll", poll_id))?;

        let mut polls = self.with_options(vec![row]).await?;
        polls
            .pop()
            .ok_or_else(|| AppError::not_found("poll", poll_id))
    }

    async fn list_polls_by_status(&self, status: PollStatus) -> AppResult<Vec<Poll>> {
        self.list_polls(
            &format!(
                "SELECT {POLL_COLUMNS} FROM polls WHERE status = $1 ORDER BY expires_at"
            ),
            status,
        )
        .await
    }

    async fn list_expired_polls(&self) -> AppResult<Vec<Poll>> {
        self.list_polls(
            &format!(
                "SELECT {POLL_COLUMNS} FROM polls WHERE status = $1 AND expires_at <= NOW() \
                 ORDER BY expires_at"
            ),
            PollStatus::Created,
        )
        .await
    }

    async fn update_poll_status(
        &self,
        poll_id: i64,
        from_status: PollStatus,
        to_status: PollStatus,
    ) -> AppResult<()> {
        validate_poll_transition(from_status, to_status)?;

        let result = sqlx::query(
            r#"
            UPDATE polls
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(poll_id)
        .bind(from_status)
        .bind(to_status)
        .execute(&self.pool)
        .await?;

        check_rows_affected("poll", poll_id, from_status, result.rows_affected())?;
        debug!("Poll {} moved {} -> {}", poll_id, from_status, to_status);
        Ok(())
    }

    async fn count_polls_by_status(&self) -> AppResult<PollStatusCounts> {
        let rows = sqlx::query_as::<_, (PollStatus, i64)>(
            "SELECT status, COUNT(*) FROM polls GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = PollStatusCounts::default();
        for (status, n) in rows {
            counts.add(status, n);
        }
        Ok(counts)
    }
}

#[async_trait]
impl VoteLedger for LedgerRepository {
    // ========== VOTE OPERATIONS ==========

    async fn create_vote(&self, vote: &NewVote) -> AppResult<Vote> {
        let created_at = Utc::now();
        let expires_at = created_at + Duration::seconds(vote.expiry_seconds);

        let row = sqlx::query_as::<_, VoteRow>(&format!(
            r#"
            INSERT INTO votes (
                id, poll_id, option_id, created_at, expires_at,
                pay_req, payment_hash, preimage, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {VOTE_COLUMNS}
            "#
        ))
        .bind(vote.id)
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(created_at)
        .bind(expires_at)
        .bind(&vote.pay_req)
        .bind(&vote.payment_hash)
        .bind(vote.preimage.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(VoteStatus::Created)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &vote.payment_hash))?;

        Ok(row.into())
    }

    async fn get_vote(&self, vote_id: i64) -> AppResult<Vote> {
        let row = sqlx::query_as::<_, VoteRow>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE id = $1"
        ))
        .bind(vote_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("vote", vote_id))?;

        Ok(row.into())
    }

    async fn get_vote_by_hash(&self, payment_hash: &str) -> AppResult<Vote> {
        let row = sqlx::query_as::<_, VoteRow>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE payment_hash = $1"
        ))
        .bind(payment_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("vote", payment_hash))?;

        Ok(row.into())
    }

    async fn list_votes_by_status(&self, poll_id: i64, status: VoteStatus) -> AppResult<Vec<Vote>> {
        self.list_votes(
            &format!(
                "SELECT {VOTE_COLUMNS} FROM votes WHERE status = $1 AND poll_id = $2 \
                 ORDER BY created_at"
            ),
            status,
            Some(poll_id),
        )
        .await
    }

    async fn list_expired_votes(&self) -> AppResult<Vec<Vote>> {
        self.list_votes(
            &format!(
                "SELECT {VOTE_COLUMNS} FROM votes WHERE status = $1 AND expires_at <= NOW() \
                 ORDER BY expires_at"
            ),
            VoteStatus::Created,
            None,
        )
        .await
    }

    async fn list_pending_votes(&self) -> AppResult<Vec<Vote>> {
        self.list_votes(
            &format!(
                "SELECT {VOTE_COLUMNS} FROM votes WHERE status = $1 AND expires_at > NOW() \
                 ORDER BY expires_at"
            ),
            VoteStatus::Created,
            None,
        )
        .await
    }

    async fn count_paid_votes(&self, poll_id: i64) -> AppResult<HashMap<i64, i64>> {
        let [paid, returned, settled] = VoteStatus::counted();
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT option_id, COUNT(*)
            FROM votes
            WHERE poll_id = $1 AND status IN ($2, $3, $4)
            GROUP BY option_id
            "#,
        )
        .bind(poll_id)
        .bind(paid)
        .bind(returned)
        .bind(settled)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn sum_settled_amount(&self, poll_id: i64) -> AppResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(settle_amount), 0)::BIGINT
            FROM votes
            WHERE poll_id = $1 AND status = $2
            "#,
        )
        .bind(poll_id)
        .bind(VoteStatus::Settled)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn update_vote_status(
        &self,
        vote_id: i64,
        from_status: VoteStatus,
        to_status: VoteStatus,
    ) -> AppResult<()> {
        validate_vote_transition(from_status, to_status)?;

        let result = sqlx::query(
            r#"
            UPDATE votes
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(vote_id)
        .bind(from_status)
        .bind(to_status)
        .execute(&self.pool)
        .await?;

        check_rows_affected("vote", vote_id, from_status, result.rows_affected())
    }

    async fn mark_paid(
        &self,
        vote_id: i64,
        settle_amount: i64,
        settle_index: Option<i64>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE votes
            SET status = $3,
                settle_amount = $4,
                settle_index = CASE
                    WHEN $5::BIGINT IS NULL THEN settle_index
                    ELSE GREATEST(COALESCE(settle_index, 0), $5::BIGINT)
                END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(vote_id)
        .bind(VoteStatus::Created)
        .bind(VoteStatus::Paid)
        .bind(settle_amount)
        .bind(settle_index)
        .execute(&self.pool)
        .await?;

        check_rows_affected("vote", vote_id, VoteStatus::Created, result.rows_affected())
    }

    async fn advance_settle_index(&self, vote_id: i64, settle_index: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE votes
            SET settle_index = $2
            WHERE id = $1 AND (settle_index IS NULL OR settle_index < $2)
            "#,
        )
        .bind(vote_id)
        .bind(settle_index)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_settle_index(&self) -> AppResult<i64> {
        let index = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(settle_index), 0)::BIGINT FROM votes",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(index)
    }
}
