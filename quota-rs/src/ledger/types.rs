use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QuotaError;
use crate::quota::{UsageCharge, UsageKind, UserId};

/// Outcome of an accounting decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerOutcome {
    Consumed,
    DeniedInsufficient,
    /// Never written by this crate: burst denials stay in memory
    DeniedRateLimited,
    Reset,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Consumed => "CONSUMED",
            LedgerOutcome::DeniedInsufficient => "DENIED_INSUFFICIENT",
            LedgerOutcome::DeniedRateLimited => "DENIED_RATE_LIMITED",
            LedgerOutcome::Reset => "RESET",
        }
    }
}

impl fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOutcome {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSUMED" => Ok(LedgerOutcome::Consumed),
            "DENIED_INSUFFICIENT" => Ok(LedgerOutcome::DeniedInsufficient),
            "DENIED_RATE_LIMITED" => Ok(LedgerOutcome::DeniedRateLimited),
            "RESET" => Ok(LedgerOutcome::Reset),
            other => Err(QuotaError::Parse(format!("unknown ledger outcome: {}", other))),
        }
    }
}

/// A persisted ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Insertion sequence, breaks ties between equal `created_at`
    pub id: i64,
    pub user_id: UserId,
    /// Units requested (or restored, for resets)
    pub amount: u64,
    pub outcome: LedgerOutcome,
    pub kind: Option<UsageKind>,
    pub description: String,
    pub input_units: Option<u64>,
    pub output_units: Option<u64>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A ledger row about to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub amount: u64,
    pub outcome: LedgerOutcome,
    pub kind: Option<UsageKind>,
    pub description: String,
    pub input_units: Option<u64>,
    pub output_units: Option<u64>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    /// Entry describing the decision taken on `charge`
    pub fn for_charge(
        user_id: &UserId,
        charge: &UsageCharge,
        outcome: LedgerOutcome,
        created_at: DateTime<Utc>,
    ) -> Self {
        let description = match outcome {
            LedgerOutcome::DeniedInsufficient => {
                format!("Insufficient units: {}", charge.description)
            }
            _ => charge.description.clone(),
        };
        NewLedgerEntry {
            user_id: user_id.clone(),
            amount: charge.amount,
            outcome,
            kind: charge.kind,
            description,
            input_units: charge.input_units,
            output_units: charge.output_units,
            request_id: charge.request_id.clone(),
            created_at,
        }
    }

    pub fn reset(
        user_id: &UserId,
        restored: u64,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        NewLedgerEntry {
            user_id: user_id.clone(),
            amount: restored,
            outcome: LedgerOutcome::Reset,
            kind: None,
            description: description.into(),
            input_units: None,
            output_units: None,
            request_id: None,
            created_at,
        }
    }
}

/// Narrowing for ledger queries; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub outcome: Option<LedgerOutcome>,
    pub kind: Option<UsageKind>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl LedgerFilter {
    pub fn latest(limit: u32) -> Self {
        LedgerFilter {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Per-outcome entry counts for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub total: u64,
    pub consumed: u64,
    pub denied: u64,
    pub reset: u64,
}
