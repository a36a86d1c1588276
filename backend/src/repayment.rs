use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::Type;

use crate::error::ValidationError;

/// Repayment policy chosen by the poll creator. Immutable once the poll exists.
///
/// Decides, per paid vote, whether the voter is refunded (hold invoice
/// cancelled) or the vote is captured (hold invoice settled) and counted
/// towards the creator's payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "repay_scheme", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepayScheme {
    /// Voters of the most popular option(s) are refunded.
    Majority,
    /// Voters of the least popular option(s) are refunded.
    Minority,
    All,
    None,
}

/// Display details for a scheme, used by poll creation forms.
#[derive(Debug, Clone, Serialize)]
pub struct RepayDetails {
    pub scheme: RepayScheme,
    pub code: i64,
    pub name: &'static str,
    pub description: &'static str,
}

impl RepayScheme {
    pub fn all() -> [RepayScheme; 4] {
        [
            RepayScheme::Majority,
            RepayScheme::Minority,
            RepayScheme::All,
            RepayScheme::None,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepayScheme::Majority => "majority",
            RepayScheme::Minority => "minority",
            RepayScheme::All => "all",
            RepayScheme::None => "none",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            RepayScheme::Majority => 1,
            RepayScheme::Minority => 2,
            RepayScheme::All => 3,
            RepayScheme::None => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ValidationError> {
        match code {
            1 => Ok(RepayScheme::Majority),
            2 => Ok(RepayScheme::Minority),
            3 => Ok(RepayScheme::All),
            4 => Ok(RepayScheme::None),
            other => Err(ValidationError::InvalidRepayScheme(other.to_string())),
        }
    }

    /// Whether votes under this scheme can ever be refunded. Schemes that
    /// never refund don't need hold invoices.
    pub fn may_refund(&self) -> bool {
        !matches!(self, RepayScheme::None)
    }

    pub fn details(&self) -> RepayDetails {
        let (name, description) = match self {
            RepayScheme::Majority => (
                "Majority",
                "Voters for the winning option get their sats back; everyone else pays.",
            ),
            RepayScheme::Minority => (
                "Minority",
                "Voters for the least popular option get their sats back; everyone else pays.",
            ),
            RepayScheme::All => ("Refund all", "Every voter is refunded once the poll closes."),
            RepayScheme::None => ("No refunds", "Every vote is paid to the poll creator."),
        };

        RepayDetails {
            scheme: *self,
            code: self.code(),
            name,
            description,
        }
    }

    /// Decide whether a voter for `option_id` is refunded, given the paid vote
    /// counts of the poll keyed by option id.
    ///
    /// Options with zero votes take no part in the extreme-set computation.
    /// Ties include every option sharing the extreme count. With no votes at
    /// all, Majority and Minority refund nobody.
    pub fn should_refund(&self, counts: &HashMap<i64, i64>, option_id: i64) -> bool {
        match self {
            RepayScheme::All => true,
            RepayScheme::None => false,
            RepayScheme::Majority => in_extreme_set(counts, option_id, |c, e| c > e),
            RepayScheme::Minority => in_extreme_set(counts, option_id, |c, e| c < e),
        }
    }
}

fn in_extreme_set(
    counts: &HashMap<i64, i64>,
    option_id: i64,
    beats: impl Fn(i64, i64) -> bool,
) -> bool {
    let extreme = counts
        .values()
        .copied()
        .filter(|count| *count > 0)
        .reduce(|best, count| if beats(count, best) { count } else { best });

    match (extreme, counts.get(&option_id)) {
        (Some(extreme), Some(&count)) => count > 0 && count == extreme,
        _ => false,
    }
}

impl fmt::Display for RepayScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RepayScheme {
    type Err = ValidationError;

    /// Accepts either the numeric code or the lowercase name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.trim().parse::<i64>() {
            return Self::from_code(code);
        }

        match s.trim().to_lowercase().as_str() {
            "majority" => Ok(RepayScheme::Majority),
            "minority" => Ok(RepayScheme::Minority),
            "all" => Ok(RepayScheme::All),
            "none" => Ok(RepayScheme::None),
            other => Err(ValidationError::InvalidRepayScheme(other.to_string())),
        }
    }
}
