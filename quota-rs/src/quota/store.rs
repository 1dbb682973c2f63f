//! Durable per-user-per-day quota records
//!
//! Statements that change a balance take a `&mut SqliteConnection` so the
//! accountant can run them in the same transaction as the ledger append.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::types::{units_from_db, units_to_db, QuotaRecord, UserId};
use crate::db::{format_date, format_timestamp, parse_date, parse_timestamp};
use crate::error::Result;

const RECORD_COLUMNS: &str = "id, user_id, usage_date, daily_limit, tokens_used, \
     tokens_remaining, reset_at, created_at, updated_at";

/// Quota record storage
#[derive(Clone)]
pub struct QuotaStore {
    db: SqlitePool,
}

impl QuotaStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                usage_date TEXT NOT NULL,
                daily_limit INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                tokens_remaining INTEGER NOT NULL,
                reset_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, usage_date),
                CHECK (tokens_used >= 0),
                CHECK (tokens_remaining >= 0),
                CHECK (tokens_used + tokens_remaining = daily_limit)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quota_records_user_date ON quota_records(user_id, usage_date DESC)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Insert-or-fetch the record for (`user_id`, `date`).
    ///
    /// Concurrent callers converge on the same row: the insert is a no-op when
    /// the row already exists.
    pub async fn fetch_or_create(
        &self,
        conn: &mut SqliteConnection,
        user_id: &UserId,
        date: NaiveDate,
        daily_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaRecord> {
        let limit = units_to_db(daily_limit)?;
        let now = format_timestamp(now);

        sqlx::query(
            r#"
            INSERT INTO quota_records (
                user_id, usage_date, daily_limit, tokens_used, tokens_remaining,
                reset_at, created_at, updated_at
            ) VALUES (?, ?, ?, 0, ?, ?, ?, ?)
            ON CONFLICT(user_id, usage_date) DO NOTHING
            "#,
        )
        .bind(user_id.as_str())
        .bind(format_date(date))
        .bind(limit)
        .bind(limit)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM quota_records WHERE user_id = ? AND usage_date = ?",
            RECORD_COLUMNS
        ))
        .bind(user_id.as_str())
        .bind(format_date(date))
        .fetch_one(&mut *conn)
        .await?;

        row_to_record(&row)
    }

    /// Look up a record without creating it
    pub async fn find(&self, user_id: &UserId, date: NaiveDate) -> Result<Option<QuotaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM quota_records WHERE user_id = ? AND usage_date = ?",
            RECORD_COLUMNS
        ))
        .bind(user_id.as_str())
        .bind(format_date(date))
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// The user's most recent record, whatever its date
    pub async fn latest_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: &UserId,
    ) -> Result<Option<QuotaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM quota_records WHERE user_id = ? ORDER BY usage_date DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Move `amount` from remaining to used.
    ///
    /// Returns `false` when the row no longer has enough remaining; nothing is
    /// written in that case.
    pub async fn apply_consume(
        &self,
        conn: &mut SqliteConnection,
        record_id: i64,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let amount = units_to_db(amount)?;
        let result = sqlx::query(
            r#"
            UPDATE quota_records
            SET tokens_used = tokens_used + ?,
                tokens_remaining = tokens_remaining - ?,
                updated_at = ?
            WHERE id = ? AND tokens_remaining >= ?
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(format_timestamp(now))
        .bind(record_id)
        .bind(amount)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Give the record its own full allowance back
    pub async fn restore_full(
        &self,
        conn: &mut SqliteConnection,
        record_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = format_timestamp(now);
        sqlx::query(
            r#"
            UPDATE quota_records
            SET tokens_used = 0,
                tokens_remaining = daily_limit,
                reset_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(record_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Re-date a stale record to `date` with a fresh allowance
    pub async fn repurpose(
        &self,
        conn: &mut SqliteConnection,
        record_id: i64,
        date: NaiveDate,
        daily_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let limit = units_to_db(daily_limit)?;
        let now = format_timestamp(now);
        let result = sqlx::query(
            r#"
            UPDATE quota_records
            SET usage_date = ?,
                daily_limit = ?,
                tokens_used = 0,
                tokens_remaining = ?,
                reset_at = ?,
                updated_at = ?
            WHERE id = ? AND usage_date <> ?
            "#,
        )
        .bind(format_date(date))
        .bind(limit)
        .bind(limit)
        .bind(&now)
        .bind(&now)
        .bind(record_id)
        .bind(format_date(date))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Users whose most recent record is not for `today`
    pub async fn stale_users(&self, today: NaiveDate) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id
            FROM quota_records
            GROUP BY user_id
            HAVING MAX(usage_date) <> ?
            ORDER BY user_id
            "#,
        )
        .bind(format_date(today))
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| UserId::parse(row.try_get::<&str, _>("user_id")?))
            .collect()
    }

    /// Most recent `days` records, newest first
    pub async fn history(&self, user_id: &UserId, days: u32) -> Result<Vec<QuotaRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM quota_records WHERE user_id = ? ORDER BY usage_date DESC LIMIT ?",
            RECORD_COLUMNS
        ))
        .bind(user_id.as_str())
        .bind(i64::from(days))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Number of stored days and mean units used per day
    pub async fn usage_summary(&self, user_id: &UserId) -> Result<(u64, f64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS days, AVG(tokens_used) AS average FROM quota_records WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_one(&self.db)
        .await?;

        let days: i64 = row.try_get("days")?;
        let average: Option<f64> = row.try_get("average")?;
        Ok((units_from_db(days)?, average.unwrap_or(0.0)))
    }
}

fn row_to_record(row: &SqliteRow) -> Result<QuotaRecord> {
    let reset_at: Option<String> = row.try_get("reset_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(QuotaRecord {
        id: row.try_get("id")?,
        user_id: UserId::parse(row.try_get::<&str, _>("user_id")?)?,
        usage_date: parse_date(row.try_get::<&str, _>("usage_date")?)?,
        daily_limit: units_from_db(row.try_get("daily_limit")?)?,
        tokens_used: units_from_db(row.try_get("tokens_used")?)?,
        tokens_remaining: units_from_db(row.try_get("tokens_remaining")?)?,
        reset_at: reset_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
