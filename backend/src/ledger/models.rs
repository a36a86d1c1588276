use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;

use crate::repayment::RepayScheme;

/// Poll status enum
///
/// Created → Closed → Released → PayingOut → PaidOut, with
/// Released → PaidOut when there is nothing to pay out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "poll_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Created,
    Closed,
    Released,
    PayingOut,
    PaidOut,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Created => "created",
            PollStatus::Closed => "closed",
            PollStatus::Released => "released",
            PollStatus::PayingOut => "paying_out",
            PollStatus::PaidOut => "paid_out",
        }
    }

    pub fn all() -> [PollStatus; 5] {
        [
            PollStatus::Created,
            PollStatus::Closed,
            PollStatus::Released,
            PollStatus::PayingOut,
            PollStatus::PaidOut,
        ]
    }

    /// Forward-only transitions. No status has a way back.
    pub fn can_transition_to(&self, to: PollStatus) -> bool {
        matches!(
            (self, to),
            (PollStatus::Created, PollStatus::Closed)
                | (PollStatus::Closed, PollStatus::Released)
                | (PollStatus::Released, PollStatus::PayingOut)
                | (PollStatus::Released, PollStatus::PaidOut)
                | (PollStatus::PayingOut, PollStatus::PaidOut)
        )
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vote status enum
///
/// Created → Expired | Paid, Paid → Returned | Settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "vote_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VoteStatus {
    Created,
    Expired,
    Paid,
    Returned,
    Settled,
}

impl VoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Created => "created",
            VoteStatus::Expired => "expired",
            VoteStatus::Paid => "paid",
            VoteStatus::Returned => "returned",
            VoteStatus::Settled => "settled",
        }
    }

    pub fn can_transition_to(&self, to: VoteStatus) -> bool {
        matches!(
            (self, to),
            (VoteStatus::Created, VoteStatus::Expired)
                | (VoteStatus::Created, VoteStatus::Paid)
                | (VoteStatus::Paid, VoteStatus::Returned)
                | (VoteStatus::Paid, VoteStatus::Settled)
        )
    }

    /// The voter's payment reached the node at some point, whatever happened
    /// to it afterwards. These are the votes that count in results.
    pub fn was_paid(&self) -> bool {
        matches!(
            self,
            VoteStatus::Paid | VoteStatus::Returned | VoteStatus::Settled
        )
    }

    pub fn counted() -> [VoteStatus; 3] {
        [VoteStatus::Paid, VoteStatus::Returned, VoteStatus::Settled]
    }
}

impl fmt::Display for VoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hold invoice preimage. Owned by its vote until the invoice is settled or
/// cancelled; never logged or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Preimage(Vec<u8>);

impl Preimage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage(<redacted>)")
    }
}

/// Option entity, owned by its poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PollOption {
    pub id: i64,
    pub poll_id: i64,
    pub value: String,
}

/// Poll entity
///
/// INVARIANT: options are non-empty and never change after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: i64,
    pub question: String,
    pub options: Vec<PollOption>,
    pub vote_sats: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expiry_seconds: i64,
    pub repay_scheme: RepayScheme,
    pub payout_invoice: String,
    #[serde(skip_serializing)]
    pub email: Option<String>,
    pub status: PollStatus,
}

impl Poll {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Open polls take votes until they expire
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PollStatus::Created && !self.is_expired_at(now)
    }

    pub fn option(&self, option_id: i64) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Poll row as stored, before its options are attached
#[derive(Debug, Clone, FromRow)]
pub struct PollRow {
    pub id: i64,
    pub question: String,
    pub vote_sats: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expiry_seconds: i64,
    pub repay_scheme: RepayScheme,
    pub payout_invoice: String,
    pub email: Option<String>,
    pub status: PollStatus,
}

impl PollRow {
    pub fn into_poll(self, options: Vec<PollOption>) -> Poll {
        Poll {
            id: self.id,
            question: self.question,
            options,
            vote_sats: self.vote_sats,
            created_at: self.created_at,
            expires_at: self.expires_at,
            expiry_seconds: self.expiry_seconds,
            repay_scheme: self.repay_scheme,
            payout_invoice: self.payout_invoice,
            email: self.email,
            status: self.status,
        }
    }
}

/// Everything needed to insert a poll and its options in one write
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub vote_sats: i64,
    pub expiry_seconds: i64,
    pub repay_scheme: RepayScheme,
    pub payout_invoice: String,
    pub email: Option<String>,
}

/// Vote entity
#[derive(Debug, Clone, Serialize)]
pub struct Vote {
    pub id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub pay_req: String,
    pub payment_hash: String,
    #[serde(skip)]
    pub preimage: Option<Preimage>,
    pub settle_index: Option<i64>,
    pub settle_amount: Option<i64>,
    pub status: VoteStatus,
}

impl Vote {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct VoteRow {
    pub id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub pay_req: String,
    pub payment_hash: String,
    pub preimage: Option<Vec<u8>>,
    pub settle_index: Option<i64>,
    pub settle_amount: Option<i64>,
    pub status: VoteStatus,
}

impl From<VoteRow> for Vote {
    fn from(row: VoteRow) -> Self {
        Vote {
            id: row.id,
            poll_id: row.poll_id,
            option_id: row.option_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            pay_req: row.pay_req,
            payment_hash: row.payment_hash,
            preimage: row.preimage.map(Preimage::new),
            settle_index: row.settle_index,
            settle_amount: row.settle_amount,
            status: row.status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewVote {
    pub id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub expiry_seconds: i64,
    pub pay_req: String,
    pub payment_hash: String,
    pub preimage: Option<Preimage>,
}

/// Number of polls per status
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatusCounts {
    pub created: i64,
    pub closed: i64,
    pub released: i64,
    pub paying_out: i64,
    pub paid_out: i64,
}

impl PollStatusCounts {
    pub fn add(&mut self, status: PollStatus, n: i64) {
        match status {
            PollStatus::Created => self.created += n,
            PollStatus::Closed => self.closed += n,
            PollStatus::Released => self.released += n,
            PollStatus::PayingOut => self.paying_out += n,
            PollStatus::PaidOut => self.paid_out += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_transitions_are_forward_only() {
        assert!(PollStatus::Created.can_transition_to(PollStatus::Closed));
        assert!(PollStatus::Released.can_transition_to(PollStatus::PaidOut));
        assert!(PollStatus::Released.can_transition_to(PollStatus::PayingOut));
        assert!(!PollStatus::Closed.can_transition_to(PollStatus::Created));
        assert!(!PollStatus::Created.can_transition_to(PollStatus::PaidOut));
        for status in PollStatus::all() {
            assert!(!PollStatus::PaidOut.can_transition_to(status));
        }
    }

    #[test]
    fn test_vote_transitions() {
        assert!(VoteStatus::Created.can_transition_to(VoteStatus::Paid));
        assert!(VoteStatus::Created.can_transition_to(VoteStatus::Expired));
        assert!(VoteStatus::Paid.can_transition_to(VoteStatus::Settled));
        assert!(!VoteStatus::Expired.can_transition_to(VoteStatus::Paid));
        assert!(!VoteStatus::Created.can_transition_to(VoteStatus::Settled));
        assert!(!VoteStatus::Returned.can_transition_to(VoteStatus::Settled));
    }

    #[test]
    fn test_preimage_is_redacted() {
        let preimage = Preimage::new(vec![0xab; 32]);
        assert_eq!(format!("{:?}", preimage), "Preimage(<redacted>)");
        assert!(!format!("{:?}", Some(preimage)).contains("171"));
    }
}
