// Shared fixtures for service and loop tests
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::api::handler::AppState;
use crate::context::OpContext;
use crate::gateway::mock::MockGateway;
use crate::gateway::{new_preimage, InvoiceState};
use crate::ledger::memory::InMemoryLedger;
use crate::ledger::models::{NewVote, Poll, Vote};
use crate::ledger::{new_id, PollLedger, VoteLedger};
use crate::polls::{PollRequest, PollService, PollSettings};
use crate::repayment::RepayScheme;
use crate::votes::VoteService;

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<MockGateway>,
    pub shutdown: CancellationToken,
    pub polls: Arc<PollService>,
    pub votes: Arc<VoteService>,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(MockGateway::new());
        let shutdown = CancellationToken::new();

        let polls = Arc::new(PollService::new(
            ledger.clone(),
            ledger.clone(),
            gateway.clone(),
            PollSettings::default(),
        ));
        let votes = Arc::new(VoteService::new(
            ledger.clone(),
            ledger.clone(),
            gateway.clone(),
            shutdown.clone(),
        ));

        Self {
            ledger,
            gateway,
            shutdown,
            polls,
            votes,
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.polls.clone(),
            self.votes.clone(),
            self.shutdown.clone(),
            std::time::Duration::from_secs(30),
        )
    }

    pub fn ctx(&self) -> OpContext {
        OpContext::background()
    }

    pub fn poll_request(&self, scheme: RepayScheme, options: &[&str]) -> PollRequest {
        PollRequest {
            question: "Which colour?".to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            vote_sats: 10,
            expiry_seconds: 3600,
            repay_scheme: scheme,
            payout_invoice: "lnbc1payout".to_string(),
            email: Some("creator@example.com".to_string()),
        }
    }

    pub async fn poll(&self, scheme: RepayScheme, options: &[&str]) -> Poll {
        self.polls
            .create_poll(&self.ctx(), self.poll_request(scheme, options))
            .await
            .unwrap()
    }

    pub async fn expire_poll(&self, poll_id: i64) {
        self.ledger
            .set_poll_expiry(poll_id, Utc::now() - Duration::seconds(1))
            .await;
    }

    pub async fn ledger_poll(&self, poll_id: i64) -> Poll {
        self.ledger.get_poll(poll_id).await.unwrap()
    }

    pub async fn ledger_vote(&self, vote_id: i64) -> Vote {
        self.ledger.get_vote(vote_id).await.unwrap()
    }

    /// A vote whose invoice the node holds, already marked Paid
    pub async fn paid_vote(&self, poll: &Poll, option: usize) -> Vote {
        let (preimage, payment_hash) = new_preimage();
        let vote = self
            .ledger
            .create_vote(&NewVote {
                id: new_id(),
                poll_id: poll.id,
                option_id: poll.options[option].id,
                expiry_seconds: 600,
                pay_req: format!("lnbcvote{}", &payment_hash[..8]),
                payment_hash: payment_hash.clone(),
                preimage: poll.repay_scheme.may_refund().then_some(preimage),
            })
            .await
            .unwrap();

        let state = if poll.repay_scheme.may_refund() {
            InvoiceState::Accepted
        } else {
            InvoiceState::Settled
        };
        self.gateway.set_invoice_state(&payment_hash, state, poll.vote_sats);
        self.ledger
            .mark_paid(vote.id, poll.vote_sats, None)
            .await
            .unwrap();

        self.ledger_vote(vote.id).await
    }
}
