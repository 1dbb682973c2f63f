//! Integration tests for the quota facade

use chrono::Duration;
use quota_rs::clock::{Clock, ManualClock};
use quota_rs::config::Config;
use quota_rs::ledger::{LedgerFilter, LedgerOutcome};
use quota_rs::quota::UsageKind;
use quota_rs::{db, DenialReason, QuotaError, QuotaFacade};
use std::sync::Arc;

async fn setup_facade(config: &Config) -> (QuotaFacade, ManualClock) {
    let pool = db::connect_in_memory().await.unwrap();
    db::init_schema(&pool).await.unwrap();
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let facade = QuotaFacade::from_config(config, pool, shared).unwrap();
    (facade, clock)
}

fn config_with_general_limit(max_requests: usize) -> Config {
    let mut config = Config::default();
    config.rate_limit.general_chat.max_requests = max_requests;
    config
}

#[tokio::test]
async fn test_eleventh_request_is_rate_limited_before_budget() {
    let (facade, _clock) = setup_facade(&config_with_general_limit(10)).await;

    for i in 0..10 {
        let decision = facade
            .check_and_consume("42", 1_000, UsageKind::Chat, &format!("message {}", i))
            .await
            .unwrap();
        assert!(decision.allowed, "request {} should pass", i);
    }

    let before = facade.daily_snapshot("42").await.unwrap();
    let ledger_before = facade.ledger("42", 100).await.unwrap().len();

    let decision = facade
        .check_and_consume("42", 1_000, UsageKind::Chat, "message 10")
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenialReason::RateLimited));
    assert_eq!(decision.remaining, before.remaining);
    assert!(decision.request_id.is_none());

    // rate-limited requests are neither charged nor ledgered
    let after = facade.daily_snapshot("42").await.unwrap();
    assert_eq!(after.used, before.used);
    assert_eq!(facade.ledger("42", 100).await.unwrap().len(), ledger_before);

    let rate_limited = facade
        .ledger_filtered(
            "42",
            &LedgerFilter {
                outcome: Some(LedgerOutcome::DeniedRateLimited),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(rate_limited.is_empty());
}

#[tokio::test]
async fn test_window_elapses() {
    let (facade, clock) = setup_facade(&config_with_general_limit(2)).await;

    for _ in 0..2 {
        assert!(facade
            .check_and_consume("42", 10, UsageKind::Chat, "chat")
            .await
            .unwrap()
            .allowed);
    }
    assert!(!facade
        .check_and_consume("42", 10, UsageKind::Chat, "chat")
        .await
        .unwrap()
        .allowed);

    clock.advance(Duration::minutes(61));
    assert!(facade
        .check_and_consume("42", 10, UsageKind::Chat, "chat")
        .await
        .unwrap()
        .allowed);
}

#[tokio::test]
async fn test_budget_denials_are_ledgered() {
    let mut config = Config::default();
    config.quota.daily_limit = 500_000;
    let (facade, _clock) = setup_facade(&config).await;

    let first = facade
        .check_and_consume("42", 300_000, UsageKind::PdfAnalysis, "report")
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 200_000);

    let second = facade
        .check_and_consume("42", 250_000, UsageKind::PdfAnalysis, "report")
        .await
        .unwrap();
    assert_eq!(second.reason, Some(DenialReason::InsufficientBudget));
    assert_eq!(second.remaining, 200_000);

    let entries = facade.ledger("42", 10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].outcome, LedgerOutcome::DeniedInsufficient);
    assert_eq!(entries[0].request_id, second.request_id);
    assert_eq!(entries[0].description, "Insufficient units: report");
    assert_eq!(entries[1].outcome, LedgerOutcome::Consumed);
}

#[tokio::test]
async fn test_missing_identity_fails_closed() {
    let (facade, _clock) = setup_facade(&Config::default()).await;

    for user in ["", "   ", "bad\nid"] {
        let err = facade
            .check_and_consume(user, 10, UsageKind::Chat, "chat")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidArgument(_)));
    }

    let too_long = "x".repeat(200);
    assert!(facade.daily_snapshot(&too_long).await.is_err());
}

#[tokio::test]
async fn test_history_and_snapshot_across_days() {
    let mut config = Config::default();
    config.quota.daily_limit = 1_000;
    let (facade, clock) = setup_facade(&config).await;

    facade
        .check_and_consume("42", 250, UsageKind::Chat, "day one")
        .await
        .unwrap();
    clock.advance(Duration::days(1));
    facade
        .check_and_consume("42", 100, UsageKind::Chat, "day two")
        .await
        .unwrap();

    let snapshot = facade.daily_snapshot("42").await.unwrap();
    assert_eq!(snapshot.used, 100);
    assert_eq!(snapshot.percent_used, 10.0);

    let history = facade.history("42", 30).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].used, 100);
    assert_eq!(history[1].used, 250);
    assert!(history[0].usage_date > history[1].usage_date);
}
