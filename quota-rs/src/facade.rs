//! Entry point for collaborators (chat endpoints, admin tools)
//!
//! The burst limiter is consulted first and costs nothing durable; only a
//! request that passes it is charged against the daily budget.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{QuotaError, Result};
use crate::ledger::{LedgerEntry, LedgerFilter};
use crate::quota::{
    ConsumeOutcome, DailySnapshot, QuotaAccountant, QuotaRecord, UsageCharge, UsageKind,
    UsageStatistics, UserId,
};
use crate::rate_limit::BurstRateLimiter;

/// Units assumed for a chat turn whose real cost is only known afterwards
pub const DEFAULT_ESTIMATED_COST: u64 = 500;

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    RateLimited,
    InsufficientBudget,
}

/// Answer to "may this user spend N units?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    /// Units left today after this decision
    pub remaining: u64,
    /// Correlates the decision with its ledger entry; absent when rate limited
    pub request_id: Option<String>,
}

impl Decision {
    fn rate_limited(remaining: u64) -> Self {
        Decision {
            allowed: false,
            reason: Some(DenialReason::RateLimited),
            remaining,
            request_id: None,
        }
    }

    fn from_outcome(outcome: ConsumeOutcome, request_id: String) -> Self {
        Decision {
            allowed: outcome.is_allowed(),
            reason: match outcome {
                ConsumeOutcome::Allowed { .. } => None,
                ConsumeOutcome::Denied { .. } => Some(DenialReason::InsufficientBudget),
            },
            remaining: outcome.remaining(),
            request_id: Some(request_id),
        }
    }
}

/// Composition of the accountant and the burst limiter
#[derive(Clone)]
pub struct QuotaFacade {
    accountant: Arc<QuotaAccountant>,
    limiter: Arc<BurstRateLimiter>,
}

impl QuotaFacade {
    pub fn new(accountant: Arc<QuotaAccountant>, limiter: Arc<BurstRateLimiter>) -> Self {
        Self {
            accountant,
            limiter,
        }
    }

    /// Wire an accountant and a limiter from configuration over an initialized pool
    pub fn from_config(config: &Config, db: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        let accountant = QuotaAccountant::new(db, Arc::clone(&clock), config.quota.daily_limit)?;
        let limiter = BurstRateLimiter::from_config(&config.rate_limit, clock)?;
        Ok(Self::new(Arc::new(accountant), Arc::new(limiter)))
    }

    pub fn accountant(&self) -> &Arc<QuotaAccountant> {
        &self.accountant
    }

    pub fn limiter(&self) -> &Arc<BurstRateLimiter> {
        &self.limiter
    }

    /// Rate-check, then charge `cost` units.
    ///
    /// A rate-limited request touches no durable state. Denials are returned
    /// as a [`Decision`]; invalid input and storage faults are errors.
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        cost: u64,
        kind: UsageKind,
        description: &str,
    ) -> Result<Decision> {
        let charge = UsageCharge::new(cost)
            .with_kind(kind)
            .with_description(description);
        self.submit(user_id, charge).await
    }

    /// Like [`check_and_consume`](Self::check_and_consume), charging
    /// `input_units + output_units` and keeping the breakdown on the ledger
    pub async fn check_and_consume_breakdown(
        &self,
        user_id: &str,
        input_units: u64,
        output_units: u64,
        kind: UsageKind,
        description: &str,
    ) -> Result<Decision> {
        let charge = UsageCharge::from_breakdown(input_units, output_units)?
            .with_kind(kind)
            .with_description(description);
        self.submit(user_id, charge).await
    }

    async fn submit(&self, user_id: &str, charge: UsageCharge) -> Result<Decision> {
        let user = UserId::parse(user_id)?;
        if charge.amount == 0 {
            return Err(QuotaError::invalid("cost must be positive"));
        }
        if charge.amount > i64::MAX as u64 {
            return Err(QuotaError::invalid(format!(
                "cost {} is out of range",
                charge.amount
            )));
        }

        let class = charge
            .kind
            .map(|kind| kind.endpoint_class())
            .unwrap_or_default();

        let Some(permit) = self.limiter.try_acquire(Some(&user), class).await else {
            debug!("Rate limited {} on {}", user, class);
            return Ok(Decision::rate_limited(self.remaining_or_zero(&user).await));
        };

        let request_id = Uuid::new_v4().to_string();
        let outcome = match self
            .accountant
            .charge(&user, charge.with_request_id(request_id.clone()))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.limiter.release(permit).await;
                return Err(e);
            }
        };

        if !outcome.is_allowed() {
            self.limiter.release(permit).await;
        }

        Ok(Decision::from_outcome(outcome, request_id))
    }

    /// Balance shown on a rate-limited decision.
    ///
    /// The denial itself needs no storage, so a failed lookup reports nothing
    /// spendable instead of turning the denial into an error.
    async fn remaining_or_zero(&self, user: &UserId) -> u64 {
        match self.accountant.remaining_today(user).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("Could not read remaining units for {}: {}", user, e);
                0
            }
        }
    }

    /// Advisory: would a call of about `estimated` units fit both limits?
    ///
    /// Nothing is recorded or charged.
    pub async fn precheck(&self, user_id: &str, kind: UsageKind, estimated: u64) -> Result<Decision> {
        let user = UserId::parse(user_id)?;
        let remaining = self.accountant.remaining_today(&user).await?;

        if !self.limiter.allow(Some(&user), kind.endpoint_class()).await {
            return Ok(Decision::rate_limited(remaining));
        }

        let allowed = remaining >= estimated;
        Ok(Decision {
            allowed,
            reason: (!allowed).then_some(DenialReason::InsufficientBudget),
            remaining,
            request_id: None,
        })
    }

    pub async fn daily_snapshot(&self, user_id: &str) -> Result<DailySnapshot> {
        let user = UserId::parse(user_id)?;
        self.accountant.snapshot(&user).await
    }

    /// Daily snapshots, most recent first
    pub async fn history(&self, user_id: &str, days: u32) -> Result<Vec<DailySnapshot>> {
        let user = UserId::parse(user_id)?;
        self.accountant.history(&user, days).await
    }

    /// Ledger entries, most recent first
    pub async fn ledger(&self, user_id: &str, limit: u32) -> Result<Vec<LedgerEntry>> {
        let user = UserId::parse(user_id)?;
        self.accountant.ledger().recent(&user, limit).await
    }

    pub async fn ledger_filtered(&self, user_id: &str, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let user = UserId::parse(user_id)?;
        self.accountant.ledger().query(&user, filter).await
    }

    pub async fn statistics(&self, user_id: &str) -> Result<UsageStatistics> {
        let user = UserId::parse(user_id)?;
        self.accountant.statistics(&user).await
    }

    /// Administrative override; authorization is the caller's job
    pub async fn admin_reset(&self, user_id: &str) -> Result<QuotaRecord> {
        let user = UserId::parse(user_id)?;
        info!("Admin reset requested for {}", user);
        self.accountant.reset_user(&user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::rate_limit::{EndpointClass, RateLimitPolicy};
    use chrono::Duration;

    async fn setup(limit: u64, max_requests: usize) -> (QuotaFacade, ManualClock) {
        let pool = db::connect_in_memory().await.unwrap();
        db::init_schema(&pool).await.unwrap();
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let accountant = QuotaAccountant::new(pool, Arc::clone(&shared), limit).unwrap();
        let policy = RateLimitPolicy::new(max_requests, Duration::hours(1)).unwrap();
        let limiter = BurstRateLimiter::new(shared)
            .with_policy(EndpointClass::GeneralChat, policy)
            .with_policy(EndpointClass::WeatherChat, policy);

        (QuotaFacade::new(Arc::new(accountant), Arc::new(limiter)), clock)
    }

    #[tokio::test]
    async fn test_allowed_decision_carries_request_id() {
        let (facade, _clock) = setup(1000, 10).await;

        let decision = facade
            .check_and_consume("alice", 100, UsageKind::Chat, "hello")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, None);
        assert_eq!(decision.remaining, 900);

        let entries = facade.ledger("alice", 10).await.unwrap();
        assert_eq!(entries[0].request_id, decision.request_id);
    }

    #[tokio::test]
    async fn test_insufficient_budget() {
        let (facade, _clock) = setup(100, 10).await;

        let decision = facade
            .check_and_consume("alice", 101, UsageKind::Chat, "too big")
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::InsufficientBudget));
        assert_eq!(decision.remaining, 100);

        // a denied charge is not a request that went through
        assert_eq!(
            facade
                .limiter()
                .count(&UserId::parse("alice").unwrap(), EndpointClass::GeneralChat)
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_input_before_state() {
        let (facade, _clock) = setup(100, 10).await;

        let err = facade
            .check_and_consume("", 10, UsageKind::Chat, "anonymous")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidArgument(_)));

        let err = facade
            .check_and_consume("alice", 0, UsageKind::Chat, "free")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidArgument(_)));
        assert!(facade.ledger("alice", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_precheck_has_no_side_effects() {
        let (facade, _clock) = setup(1000, 1).await;

        for _ in 0..3 {
            let decision = facade
                .precheck("alice", UsageKind::Chat, DEFAULT_ESTIMATED_COST)
                .await
                .unwrap();
            assert!(decision.allowed);
        }

        let decision = facade
            .precheck("alice", UsageKind::Chat, 5000)
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(DenialReason::InsufficientBudget));
        assert!(facade.ledger("alice", 10).await.unwrap().is_empty());
        assert_eq!(facade.daily_snapshot("alice").await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_weather_and_chat_limited_separately() {
        let (facade, _clock) = setup(10_000, 1).await;

        let first = facade
            .check_and_consume("alice", 10, UsageKind::WeatherChat, "forecast")
            .await
            .unwrap();
        assert!(first.allowed);

        let second = facade
            .check_and_consume("alice", 10, UsageKind::WeatherChat, "forecast")
            .await
            .unwrap();
        assert_eq!(second.reason, Some(DenialReason::RateLimited));

        let chat = facade
            .check_and_consume("alice", 10, UsageKind::PdfAnalysis, "summary")
            .await
            .unwrap();
        assert!(chat.allowed);
    }

    #[tokio::test]
    async fn test_rate_limited_without_storage() {
        let (facade, _clock) = setup(1000, 1).await;

        assert!(facade
            .check_and_consume("alice", 10, UsageKind::Chat, "chat")
            .await
            .unwrap()
            .allowed);

        sqlx::query("DROP TABLE quota_records")
            .execute(facade.accountant().ledger().pool())
            .await
            .unwrap();

        let decision = facade
            .check_and_consume("alice", 10, UsageKind::Chat, "chat")
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(DenialReason::RateLimited));
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_storage_failure_releases_burst_slot() {
        let (facade, _clock) = setup(1000, 1).await;
        let alice = UserId::parse("alice").unwrap();

        sqlx::query("DROP TABLE ledger_entries")
            .execute(facade.accountant().ledger().pool())
            .await
            .unwrap();

        let err = facade
            .check_and_consume("alice", 10, UsageKind::Chat, "chat")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::StorageUnavailable(_)));
        assert_eq!(
            facade.limiter().count(&alice, EndpointClass::GeneralChat).await,
            0
        );
    }

    #[tokio::test]
    async fn test_admin_reset() {
        let (facade, _clock) = setup(1000, 10).await;

        facade
            .check_and_consume_breakdown("alice", 300, 200, UsageKind::Chat, "chat")
            .await
            .unwrap();
        let record = facade.admin_reset("alice").await.unwrap();
        assert_eq!(record.tokens_remaining, 1000);

        let stats = facade.statistics("alice").await.unwrap();
        assert_eq!(stats.reset_count, 1);
        assert_eq!(stats.consumed_count, 1);
    }
}
