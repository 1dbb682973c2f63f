//! Daily reset sweep
//!
//! Lazily created day records already make the accountant correct without
//! this. The sweep rolls every stale user forward at a predictable wall-clock
//! time and leaves a RESET entry on the ledger for each of them.

use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::quota::{QuotaAccountant, UserId};

/// A user the sweep could not roll over
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub user_id: UserId,
    pub error: String,
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub reset: usize,
    /// Already current by the time their turn came
    pub skipped: usize,
    pub failed: Vec<SweepFailure>,
}

pub struct DailyResetScheduler {
    accountant: Arc<QuotaAccountant>,
    clock: Arc<dyn Clock>,
    reset_time: NaiveTime,
    preserve_history: bool,
    enabled: bool,
}

impl DailyResetScheduler {
    pub fn new(accountant: Arc<QuotaAccountant>, reset_time: NaiveTime) -> Self {
        let clock = Arc::clone(accountant.clock());
        Self {
            accountant,
            clock,
            reset_time,
            preserve_history: false,
            enabled: true,
        }
    }

    pub fn from_config(accountant: Arc<QuotaAccountant>, config: &SchedulerConfig) -> Result<Self> {
        Ok(Self::new(accountant, config.reset_time()?)
            .with_preserve_history(config.preserve_history)
            .with_enabled(config.enabled))
    }

    /// A disabled scheduler never sweeps on its own; `run_once` still works
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Insert a fresh row per day instead of re-dating the stale one
    pub fn with_preserve_history(mut self, preserve_history: bool) -> Self {
        self.preserve_history = preserve_history;
        self
    }

    pub fn reset_time(&self) -> NaiveTime {
        self.reset_time
    }

    /// Roll every stale user forward to today.
    ///
    /// A failure for one user is logged and recorded in the report; the sweep
    /// carries on with the others. Only failing to list users is an error.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let today = self.clock.today();
        let users = self.accountant.stale_users(today).await?;
        let mut report = SweepReport {
            examined: users.len(),
            ..Default::default()
        };

        for user_id in users {
            match self
                .accountant
                .reset_stale(&user_id, today, self.preserve_history)
                .await
            {
                Ok(true) => report.reset += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!("Daily reset failed for {}: {}", user_id, e);
                    report.failed.push(SweepFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let pruned = self.accountant.prune_locks().await;
        debug!("Pruned {} idle user locks", pruned);

        info!(
            "Daily reset for {}: {} examined, {} reset, {} skipped, {} failed",
            today,
            report.examined,
            report.reset,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    /// Catch up on a sweep missed while the process was down, then keep
    /// sweeping in the background. Does nothing when disabled.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.enabled {
            info!("Daily reset scheduler disabled");
            return None;
        }

        match self.run_once().await {
            Ok(report) if !report.failed.is_empty() => {
                error!("Startup sweep left {} users stale", report.failed.len())
            }
            Ok(_) => {}
            Err(e) => error!("Startup sweep failed: {}", e),
        }

        Some(tokio::spawn(self.run(shutdown)))
    }

    /// Sweep at the configured time every day until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting daily reset scheduler at {} local time", self.reset_time);

        loop {
            let now = self.clock.now();
            let next = next_run_after(now, self.reset_time);
            let wait = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            debug!("Next daily reset at {}", next);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_once().await {
                        error!("Daily reset sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Daily reset scheduler stopped");
    }
}

/// First instant strictly after `now` whose local time of day is `at`.
///
/// A day on which `at` does not exist locally (DST gap) is skipped.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let local_today = now.with_timezone(&Local).date_naive();

    for offset in 0..=2 {
        let day = local_today + Duration::days(offset);
        if let Some(candidate) = day.and_time(at).and_local_timezone(Local).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
    }

    now + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::ledger::{LedgerFilter, LedgerOutcome};
    use chrono::{TimeZone, Timelike};

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn midnight() -> NaiveTime {
        NaiveTime::from_hms_opt(0, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<QuotaAccountant>, ManualClock, sqlx::SqlitePool) {
        let pool = db::connect_in_memory().await.unwrap();
        db::init_schema(&pool).await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 12, 12, 0, 0).unwrap());
        let accountant = QuotaAccountant::new(pool.clone(), Arc::new(clock.clone()), 500_000).unwrap();
        (Arc::new(accountant), clock, pool)
    }

    #[tokio::test]
    async fn test_sweep_rolls_yesterday_forward() {
        let (accountant, clock, _pool) = setup().await;
        let alice = user("alice");
        accountant.try_consume(&alice, 450_000).await.unwrap();

        clock.advance(Duration::days(1));
        let scheduler = DailyResetScheduler::new(Arc::clone(&accountant), midnight());
        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.reset, 1);
        assert!(report.failed.is_empty());

        let record = accountant.find_today(&alice).await.unwrap().unwrap();
        assert_eq!(record.usage_date, clock.today());
        assert_eq!(record.tokens_used, 0);
        assert_eq!(record.tokens_remaining, 500_000);
        assert!(record.reset_at.is_some());

        let resets = accountant
            .ledger()
            .query(
                &alice,
                &LedgerFilter {
                    outcome: Some(LedgerOutcome::Reset),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].amount, 450_000);

        // Nothing left to do on a second run
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_sweep_preserving_history_keeps_yesterday() {
        let (accountant, clock, _pool) = setup().await;
        let alice = user("alice");
        accountant.try_consume(&alice, 1_000).await.unwrap();

        clock.advance(Duration::days(1));
        let scheduler =
            DailyResetScheduler::new(Arc::clone(&accountant), midnight()).with_preserve_history(true);
        assert_eq!(scheduler.run_once().await.unwrap().reset, 1);

        let history = accountant.history(&alice, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].used, 1_000);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failures() {
        let (accountant, clock, pool) = setup().await;
        let alice = user("alice");
        accountant.try_consume(&alice, 10).await.unwrap();

        sqlx::query(
            "INSERT INTO quota_records (user_id, usage_date, daily_limit, tokens_used, tokens_remaining, created_at, updated_at)
             VALUES ('aaa-broken', 'not-a-date', 10, 0, 10, 'x', 'x')",
        )
        .execute(&pool)
        .await
        .unwrap();

        clock.advance(Duration::days(1));
        let scheduler = DailyResetScheduler::new(Arc::clone(&accountant), midnight());
        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.reset, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].user_id, user("aaa-broken"));

        let record = accountant.find_today(&alice).await.unwrap().unwrap();
        assert_eq!(record.tokens_used, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (accountant, _clock, _pool) = setup().await;
        let scheduler = Arc::new(DailyResetScheduler::new(accountant, midnight()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_scheduler_leaves_stale_users() {
        let (accountant, clock, _pool) = setup().await;
        let alice = user("alice");
        accountant.try_consume(&alice, 1_000).await.unwrap();
        clock.advance(Duration::days(1));

        let config = SchedulerConfig {
            enabled: false,
            ..Default::default()
        };
        let scheduler = Arc::new(DailyResetScheduler::from_config(Arc::clone(&accountant), &config).unwrap());
        assert!(!scheduler.is_enabled());

        let handle = Arc::clone(&scheduler).start(CancellationToken::new()).await;
        assert!(handle.is_none());
        assert_eq!(accountant.stale_users(clock.today()).await.unwrap(), vec![alice.clone()]);

        // an explicit sweep still runs
        assert_eq!(scheduler.run_once().await.unwrap().reset, 1);
    }

    #[tokio::test]
    async fn test_start_catches_up_before_spawning() {
        let (accountant, clock, _pool) = setup().await;
        let alice = user("alice");
        accountant.try_consume(&alice, 1_000).await.unwrap();
        clock.advance(Duration::days(1));

        let scheduler = Arc::new(DailyResetScheduler::new(Arc::clone(&accountant), midnight()));
        let shutdown = CancellationToken::new();
        let handle = scheduler.start(shutdown.clone()).await.unwrap();

        assert!(accountant.stale_users(clock.today()).await.unwrap().is_empty());
        let record = accountant.find_today(&alice).await.unwrap().unwrap();
        assert_eq!(record.tokens_used, 0);

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_next_run_after() {
        let now = Local
            .with_ymd_and_hms(2024, 6, 15, 10, 0, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);

        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let next = next_run_after(now, noon);
        assert_eq!(next - now, Duration::hours(2));

        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let next = next_run_after(now, nine);
        assert_eq!(next - now, Duration::hours(23));
        assert_eq!(next.with_timezone(&Local).hour(), 9);

        // exactly at the reset time schedules tomorrow
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        assert_eq!(next_run_after(now, ten) - now, Duration::days(1));
    }
}
