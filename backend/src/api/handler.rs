use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::models::*;
use crate::{
    context::OpContext,
    error::AppResult,
    middleware::ValidatedJson,
    polls::PollService,
    votes::{PollResults, VoteService},
};

#[derive(Clone)]
pub struct AppState {
    pub polls: Arc<PollService>,
    pub votes: Arc<VoteService>,
    pub shutdown: CancellationToken,
    /// Deadline for everything one request does
    pub request_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        polls: Arc<PollService>,
        votes: Arc<VoteService>,
        shutdown: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            polls,
            votes,
            shutdown,
            request_timeout,
            started_at: Utc::now(),
        }
    }

    fn ctx(&self) -> OpContext {
        OpContext::new(self.shutdown.child_token()).with_timeout(self.request_timeout)
    }
}

/// Open a poll
/// POST /polls
pub async fn create_poll(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreatePollRequest>,
) -> AppResult<(StatusCode, Json<PollResponse>)> {
    let request = request.into_poll_request()?;
    info!("Creating poll with {} options ({})", request.options.len(), request.repay_scheme);

    let poll = state.polls.create_poll(&state.ctx(), request).await?;
    Ok((StatusCode::CREATED, Json(PollResponse::from(poll))))
}

/// GET /polls/:id
pub async fn get_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> AppResult<Json<PollResponse>> {
    let poll = state.polls.lookup_poll(&state.ctx(), poll_id).await?;
    Ok(Json(poll.into()))
}

/// GET /polls/active
pub async fn list_active_polls(State(state): State<AppState>) -> AppResult<Json<PollListResponse>> {
    let polls = state.polls.list_active_polls(&state.ctx()).await?;
    Ok(Json(polls.into()))
}

/// GET /polls/inactive
pub async fn list_inactive_polls(
    State(state): State<AppState>,
) -> AppResult<Json<PollListResponse>> {
    let polls = state.polls.list_inactive_polls(&state.ctx()).await?;
    Ok(Json(polls.into()))
}

/// Close a poll ahead of its expiry, or resume a stuck payout
/// POST /polls/:id/close
pub async fn close_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> AppResult<Json<PollResponse>> {
    info!("Close requested for poll {}", poll_id);
    let poll = state.polls.force_close_poll(&state.ctx(), poll_id).await?;
    Ok(Json(poll.into()))
}

/// Paid votes per option, in option order
/// GET /polls/:id/results
pub async fn get_results(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> AppResult<Json<ResultsResponse>> {
    let PollResults { poll, counts } = state.votes.get_results(&state.ctx(), poll_id).await?;

    let results: Vec<OptionResult> = poll
        .options
        .iter()
        .map(|o| OptionResult {
            option_id: o.id,
            value: o.value.clone(),
            votes: counts.get(&o.id).copied().unwrap_or(0),
        })
        .collect();

    Ok(Json(ResultsResponse {
        poll_id,
        total_votes: results.iter().map(|r| r.votes).sum(),
        question: poll.question,
        status: poll.status,
        results,
    }))
}

/// Vote for an option. The response carries the invoice to pay.
/// POST /votes
pub async fn cast_vote(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CastVoteRequest>,
) -> AppResult<(StatusCode, Json<VoteResponse>)> {
    let created = state
        .votes
        .cast_vote(&state.ctx(), request.poll_id, request.option_id)
        .await?;

    // the subscription outlives the request
    let vote = created.vote;
    info!("🗳️ Vote {} created for poll {}", vote.id, vote.poll_id);

    Ok((StatusCode::CREATED, Json(vote.into())))
}

/// GET /votes/:id
pub async fn get_vote(
    State(state): State<AppState>,
    Path(vote_id): Path<i64>,
) -> AppResult<Json<VoteResponse>> {
    let vote = state.votes.lookup_vote(&state.ctx(), vote_id).await?;
    Ok(Json(vote.into()))
}

/// GET /schemes
pub async fn list_schemes(State(state): State<AppState>) -> Json<SchemesResponse> {
    Json(SchemesResponse {
        schemes: state.polls.list_repay_schemes(),
    })
}

/// GET /stats
pub async fn get_stats(State(state): State<AppState>) -> AppResult<Json<StatsResponse>> {
    let polls = state.polls.count_polls_by_status(&state.ctx()).await?;
    Ok(Json(StatsResponse {
        polls,
        timestamp: Utc::now(),
    }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: if state.shutdown.is_cancelled() {
            "shutting_down".to_string()
        } else {
            "healthy".to_string()
        },
        timestamp: now,
        uptime_seconds: (now - state.started_at).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, LedgerError, ValidationError};
    use crate::ledger::models::{PollStatus, VoteStatus};
    use crate::repayment::RepayScheme;
    use crate::testing::Harness;

    fn poll_body(scheme: serde_json::Value) -> CreatePollRequest {
        serde_json::from_value(serde_json::json!({
            "question": "Best editor?",
            "options": ["vim", "emacs", " "],
            "vote_sats": 25,
            "expiry_seconds": 3600,
            "repay_scheme": scheme,
            "payout_invoice": "lnbc1payout",
            "email": "owner@example.com",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_lifecycle_over_handlers() {
        let h = Harness::new();
        let state = h.state();

        let (status, Json(poll)) = create_poll(
            State(state.clone()),
            ValidatedJson(poll_body(serde_json::json!("majority"))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(poll.options.len(), 2);
        assert_eq!(poll.vote_sats, 25);

        let Json(active) = list_active_polls(State(state.clone())).await.unwrap();
        assert_eq!(active.count, 1);

        let (status, Json(vote)) = cast_vote(
            State(state.clone()),
            ValidatedJson(CastVoteRequest {
                poll_id: poll.poll_id,
                option_id: poll.options[1].option_id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(vote.status, VoteStatus::Created);
        assert!(vote.pay_req.starts_with("lnbc"));
        assert_eq!(h.gateway.added()[0].amount, 25);
        assert_eq!(h.gateway.added()[0].memo, "Vote: emacs for poll: Best editor?");

        let Json(fetched) = get_vote(State(state.clone()), Path(vote.vote_id)).await.unwrap();
        assert_eq!(fetched.payment_hash, vote.payment_hash);

        let Json(closed) = close_poll(State(state.clone()), Path(poll.poll_id)).await.unwrap();
        assert_eq!(closed.status, PollStatus::PaidOut);

        // the unpaid vote is expired and its invoice withdrawn
        let Json(fetched) = get_vote(State(state.clone()), Path(vote.vote_id)).await.unwrap();
        assert_eq!(fetched.status, VoteStatus::Expired);
        assert_eq!(h.gateway.cancelled(), vec![vote.payment_hash.clone()]);

        let Json(inactive) = list_inactive_polls(State(state.clone())).await.unwrap();
        assert_eq!(inactive.count, 1);

        let Json(stats) = get_stats(State(state)).await.unwrap();
        assert_eq!(stats.polls.paid_out, 1);
        assert_eq!(stats.polls.created, 0);
    }

    #[tokio::test]
    async fn test_results_list_every_option() {
        let h = Harness::new();
        let poll = h.poll(RepayScheme::All, &["a", "b", "c"]).await;
        h.paid_vote(&poll, 0).await;
        h.paid_vote(&poll, 0).await;
        h.paid_vote(&poll, 2).await;

        let Json(results) = get_results(State(h.state()), Path(poll.id)).await.unwrap();
        let votes: Vec<i64> = results.results.iter().map(|r| r.votes).collect();
        assert_eq!(votes, vec![2, 0, 1]);
        assert_eq!(results.total_votes, 3);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_rejected() {
        let h = Harness::new();
        let err = create_poll(State(h.state()), ValidatedJson(poll_body(serde_json::json!(0))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::InvalidRepayScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_poll_is_not_found() {
        let h = Harness::new();
        let err = get_poll(State(h.state()), Path(42)).await.unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_schemes_and_health() {
        let h = Harness::new();

        let Json(schemes) = list_schemes(State(h.state())).await;
        let codes: Vec<i64> = schemes.schemes.iter().map(|s| s.code).collect();
        assert_eq!(codes, vec![1, 2, 3, 4]);

        let Json(health) = health_check(State(h.state())).await;
        assert_eq!(health.status, "healthy");
        h.shutdown.cancel();
        let Json(health) = health_check(State(h.state())).await;
        assert_eq!(health.status, "shutting_down");
    }
}
