use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QuotaError, Result};
use crate::rate_limit::EndpointClass;

/// Longest accepted user identifier, in bytes
pub const MAX_USER_ID_LEN: usize = 128;

/// Opaque, validated identifier of a user owned by some other system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validate a caller-supplied identifier. There is no fallback identity:
    /// anything empty or malformed is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(QuotaError::invalid("user identifier is required"));
        }
        if raw.trim() != raw {
            return Err(QuotaError::invalid(
                "user identifier has leading or trailing whitespace",
            ));
        }
        if raw.len() > MAX_USER_ID_LEN {
            return Err(QuotaError::invalid(format!(
                "user identifier longer than {} bytes",
                MAX_USER_ID_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(QuotaError::invalid("user identifier contains control characters"));
        }
        Ok(UserId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        UserId::parse(s)
    }
}

/// What a charge was spent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageKind {
    /// Plain chat message
    Chat,
    /// Chat turn that analysed an image attachment
    ImageAnalysis,
    /// Chat turn that analysed a PDF attachment
    PdfAnalysis,
    /// Weather assistant, backed by a more expensive model
    WeatherChat,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Chat => "CHAT",
            UsageKind::ImageAnalysis => "IMAGE_ANALYSIS",
            UsageKind::PdfAnalysis => "PDF_ANALYSIS",
            UsageKind::WeatherChat => "WEATHER_CHAT",
        }
    }

    /// Burst-limit bucket this kind of request is throttled in
    pub fn endpoint_class(&self) -> EndpointClass {
        match self {
            UsageKind::WeatherChat => EndpointClass::WeatherChat,
            UsageKind::Chat | UsageKind::ImageAnalysis | UsageKind::PdfAnalysis => {
                EndpointClass::GeneralChat
            }
        }
    }
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageKind {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CHAT" => Ok(UsageKind::Chat),
            "IMAGE_ANALYSIS" => Ok(UsageKind::ImageAnalysis),
            "PDF_ANALYSIS" => Ok(UsageKind::PdfAnalysis),
            "WEATHER_CHAT" => Ok(UsageKind::WeatherChat),
            other => Err(QuotaError::Parse(format!("unknown usage kind: {}", other))),
        }
    }
}

/// One user's allowance for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub id: i64,
    pub user_id: UserId,
    /// Local calendar day the record applies to
    pub usage_date: NaiveDate,
    pub daily_limit: u64,
    pub tokens_used: u64,
    pub tokens_remaining: u64,
    /// Last creation or reset
    pub reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// `tokens_used + tokens_remaining == daily_limit`
    pub fn is_consistent(&self) -> bool {
        self.tokens_used.checked_add(self.tokens_remaining) == Some(self.daily_limit)
    }

    pub fn usage_percent(&self) -> f64 {
        usage_percent(self.tokens_used, self.daily_limit)
    }

    pub fn snapshot(&self) -> DailySnapshot {
        DailySnapshot {
            user_id: self.user_id.clone(),
            usage_date: self.usage_date,
            used: self.tokens_used,
            remaining: self.tokens_remaining,
            limit: self.daily_limit,
            percent_used: self.usage_percent(),
        }
    }
}

/// Read-only view of a day's usage, as shown to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub user_id: UserId,
    pub usage_date: NaiveDate,
    pub used: u64,
    pub remaining: u64,
    pub limit: u64,
    pub percent_used: f64,
}

impl DailySnapshot {
    /// Snapshot of a day nobody has spent anything on yet
    pub fn untouched(user_id: UserId, usage_date: NaiveDate, limit: u64) -> Self {
        DailySnapshot {
            user_id,
            usage_date,
            used: 0,
            remaining: limit,
            limit,
            percent_used: 0.0,
        }
    }
}

/// Result of a consume attempt against the daily budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Allowed { used: u64, remaining: u64 },
    Denied { shortfall: u64, remaining: u64 },
}

impl ConsumeOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsumeOutcome::Allowed { .. })
    }

    pub fn remaining(&self) -> u64 {
        match self {
            ConsumeOutcome::Allowed { remaining, .. } | ConsumeOutcome::Denied { remaining, .. } => {
                *remaining
            }
        }
    }
}

/// A request to spend units, with the audit details that go on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsageCharge {
    pub amount: u64,
    pub kind: Option<UsageKind>,
    pub description: String,
    pub input_units: Option<u64>,
    pub output_units: Option<u64>,
    pub request_id: Option<String>,
}

impl UsageCharge {
    pub fn new(amount: u64) -> Self {
        UsageCharge {
            amount,
            ..Default::default()
        }
    }

    /// Charge for a downstream call that reported its input and output size
    pub fn from_breakdown(input_units: u64, output_units: u64) -> Result<Self> {
        let amount = input_units
            .checked_add(output_units)
            .ok_or_else(|| QuotaError::invalid("input + output units overflow"))?;
        Ok(UsageCharge {
            amount,
            input_units: Some(input_units),
            output_units: Some(output_units),
            ..Default::default()
        })
    }

    pub fn with_kind(mut self, kind: UsageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Aggregated usage figures for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub today: DailySnapshot,
    pub daily_limit: u64,
    /// Mean of `tokens_used` over every stored day
    pub average_daily_usage: f64,
    pub history_days: u64,
    pub ledger_total: u64,
    pub consumed_count: u64,
    pub denied_count: u64,
    pub reset_count: u64,
}

pub fn usage_percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    (used as f64 / limit as f64) * 100.0
}

/// Units as stored in SQLite
pub(crate) fn units_to_db(units: u64) -> Result<i64> {
    i64::try_from(units).map_err(|_| QuotaError::invalid(format!("{} units is out of range", units)))
}

pub(crate) fn units_from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| QuotaError::Parse(format!("negative unit count {}", value)))
}
