use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::locks::UserLocks;
use super::store::QuotaStore;
use super::types::{
    ConsumeOutcome, DailySnapshot, QuotaRecord, UsageCharge, UsageKind, UsageStatistics, UserId,
};
use crate::clock::Clock;
use crate::error::{QuotaError, Result};
use crate::ledger::{LedgerOutcome, NewLedgerEntry, TransactionLedger};

/// Sole mutator of quota records.
///
/// Every change to a user's balance runs under that user's lock and inside a
/// single database transaction together with its ledger entry. Either both
/// land or neither does.
pub struct QuotaAccountant {
    quotas: QuotaStore,
    ledger: TransactionLedger,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
    daily_limit: u64,
}

impl QuotaAccountant {
    /// Create an accountant over an initialized pool
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>, daily_limit: u64) -> Result<Self> {
        if daily_limit == 0 || daily_limit > i64::MAX as u64 {
            return Err(QuotaError::invalid(format!(
                "daily limit {} is out of range",
                daily_limit
            )));
        }

        Ok(QuotaAccountant {
            quotas: QuotaStore::new(db.clone()),
            ledger: TransactionLedger::new(db),
            clock,
            locks: UserLocks::new(),
            daily_limit,
        })
    }

    /// Allowance given to newly created day records
    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Today's record, created with the full allowance if absent
    pub async fn get_or_create_today(&self, user_id: &UserId) -> Result<QuotaRecord> {
        let now = self.clock.now();
        let mut conn = self.quotas.pool().acquire().await?;
        self.quotas
            .fetch_or_create(&mut conn, user_id, self.clock.today(), self.daily_limit, now)
            .await
    }

    /// Today's record if one exists; never writes
    pub async fn find_today(&self, user_id: &UserId) -> Result<Option<QuotaRecord>> {
        self.quotas.find(user_id, self.clock.today()).await
    }

    /// Units the user could still spend today; never writes
    pub async fn remaining_today(&self, user_id: &UserId) -> Result<u64> {
        Ok(match self.find_today(user_id).await? {
            Some(record) => record.tokens_remaining,
            None => self.daily_limit,
        })
    }

    /// Advisory check before an expensive call; the real charge may still be denied
    pub async fn can_afford(&self, user_id: &UserId, estimated: u64) -> Result<bool> {
        Ok(self.remaining_today(user_id).await? >= estimated)
    }

    /// Spend `amount` units from today's budget
    pub async fn try_consume(&self, user_id: &UserId, amount: u64) -> Result<ConsumeOutcome> {
        self.charge(user_id, UsageCharge::new(amount)).await
    }

    /// Spend `input_units + output_units`, keeping the breakdown on the ledger
    pub async fn consume_with_breakdown(
        &self,
        user_id: &UserId,
        input_units: u64,
        output_units: u64,
        kind: UsageKind,
        description: &str,
    ) -> Result<ConsumeOutcome> {
        let charge = UsageCharge::from_breakdown(input_units, output_units)?
            .with_kind(kind)
            .with_description(description);
        self.charge(user_id, charge).await
    }

    /// Atomic check-and-consume.
    ///
    /// Denials are recorded on the ledger and returned as
    /// [`ConsumeOutcome::Denied`]; only invalid input and storage faults are
    /// errors. If the ledger cannot be written nothing is consumed.
    pub async fn charge(&self, user_id: &UserId, charge: UsageCharge) -> Result<ConsumeOutcome> {
        if charge.amount == 0 {
            return Err(QuotaError::invalid("amount must be positive"));
        }
        if charge.amount > i64::MAX as u64 {
            return Err(QuotaError::invalid(format!(
                "amount {} is out of range",
                charge.amount
            )));
        }

        let _guard = self.locks.acquire(user_id).await;
        let now = self.clock.now();
        let today = self.clock.today();

        let mut tx = self.quotas.pool().begin().await?;
        let record = self
            .quotas
            .fetch_or_create(&mut tx, user_id, today, self.daily_limit, now)
            .await?;

        let consumed = self
            .quotas
            .apply_consume(&mut tx, record.id, charge.amount, now)
            .await?;

        let (outcome, result) = if consumed {
            let used = record.tokens_used + charge.amount;
            let remaining = record.tokens_remaining - charge.amount;
            (
                LedgerOutcome::Consumed,
                ConsumeOutcome::Allowed { used, remaining },
            )
        } else {
            (
                LedgerOutcome::DeniedInsufficient,
                ConsumeOutcome::Denied {
                    shortfall: charge.amount.saturating_sub(record.tokens_remaining),
                    remaining: record.tokens_remaining,
                },
            )
        };

        self.ledger
            .append(&mut tx, &NewLedgerEntry::for_charge(user_id, &charge, outcome, now))
            .await?;
        tx.commit().await?;

        match result {
            ConsumeOutcome::Allowed { remaining, .. } => {
                debug!(
                    "Consumed {} units for {} ({} remaining)",
                    charge.amount, user_id, remaining
                );
            }
            ConsumeOutcome::Denied { shortfall, remaining } => {
                warn!(
                    "Insufficient units for {}: requested {}, remaining {} (short by {})",
                    user_id, charge.amount, remaining, shortfall
                );
            }
        }

        Ok(result)
    }

    /// Put today's record back to its full allowance.
    ///
    /// Always appends a RESET entry, even when nothing was spent.
    pub async fn reset_user(&self, user_id: &UserId) -> Result<QuotaRecord> {
        let _guard = self.locks.acquire(user_id).await;
        let now = self.clock.now();
        let today = self.clock.today();

        let mut tx = self.quotas.pool().begin().await?;
        let record = self
            .quotas
            .fetch_or_create(&mut tx, user_id, today, self.daily_limit, now)
            .await?;
        let restored = record.tokens_used;
        self.quotas.restore_full(&mut tx, record.id, now).await?;
        self.ledger
            .append(
                &mut tx,
                &NewLedgerEntry::reset(user_id, restored, "Manual reset", now),
            )
            .await?;
        let record = self
            .quotas
            .fetch_or_create(&mut tx, user_id, today, self.daily_limit, now)
            .await?;
        tx.commit().await?;

        info!("Reset quota for {} ({} units restored)", user_id, restored);
        Ok(record)
    }

    /// Bring a user's latest record forward to `today`.
    ///
    /// Returns `false` when the user has no record or is already current.
    /// With `preserve_history` the stale row is left alone and a fresh one is
    /// inserted; otherwise the stale row itself is re-dated.
    pub async fn reset_stale(
        &self,
        user_id: &UserId,
        today: NaiveDate,
        preserve_history: bool,
    ) -> Result<bool> {
        let _guard = self.locks.acquire(user_id).await;
        let now = self.clock.now();

        // Stable while the guard is held: only this type mutates records.
        let latest = {
            let mut conn = self.quotas.pool().acquire().await?;
            self.quotas.latest_for_user(&mut conn, user_id).await?
        };
        let stale = match latest {
            Some(record) if record.usage_date < today => record,
            _ => return Ok(false),
        };

        let mut tx = self.quotas.pool().begin().await?;
        if preserve_history {
            self.quotas
                .fetch_or_create(&mut tx, user_id, today, self.daily_limit, now)
                .await?;
        } else if !self
            .quotas
            .repurpose(&mut tx, stale.id, today, self.daily_limit, now)
            .await?
        {
            return Ok(false);
        }

        self.ledger
            .append(
                &mut tx,
                &NewLedgerEntry::reset(user_id, stale.tokens_used, "Daily reset", now),
            )
            .await?;
        tx.commit().await?;

        debug!(
            "Rolled {} over from {} to {}",
            user_id, stale.usage_date, today
        );
        Ok(true)
    }

    /// Users whose latest record predates `today`
    pub async fn stale_users(&self, today: NaiveDate) -> Result<Vec<UserId>> {
        self.quotas.stale_users(today).await
    }

    /// Today's figures; a user with no record yet sees a full allowance
    pub async fn snapshot(&self, user_id: &UserId) -> Result<DailySnapshot> {
        let today = self.clock.today();
        Ok(match self.quotas.find(user_id, today).await? {
            Some(record) => record.snapshot(),
            None => DailySnapshot::untouched(user_id.clone(), today, self.daily_limit),
        })
    }

    /// Most recent `days` daily snapshots, newest first
    pub async fn history(&self, user_id: &UserId, days: u32) -> Result<Vec<DailySnapshot>> {
        let records = self.quotas.history(user_id, days).await?;
        Ok(records.iter().map(QuotaRecord::snapshot).collect())
    }

    /// Read-only aggregation over stored days and the ledger
    pub async fn statistics(&self, user_id: &UserId) -> Result<UsageStatistics> {
        let today = self.snapshot(user_id).await?;
        let (history_days, average_daily_usage) = self.quotas.usage_summary(user_id).await?;
        let counts = self.ledger.counts(user_id).await?;

        Ok(UsageStatistics {
            daily_limit: today.limit,
            today,
            average_daily_usage,
            history_days,
            ledger_total: counts.total,
            consumed_count: counts.consumed,
            denied_count: counts.denied,
            reset_count: counts.reset,
        })
    }

    /// Drop per-user locks nobody is holding
    pub async fn prune_locks(&self) -> usize {
        self.locks.prune().await
    }
}
