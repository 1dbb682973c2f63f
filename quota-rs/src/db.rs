//! SQLite pool setup and schema

use crate::error::{QuotaError, Result};
use crate::ledger::TransactionLedger;
use crate::quota::QuotaStore;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open a pool on `database_url`, creating the database file if needed
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    info!("Connected to {}", database_url);
    Ok(pool)
}

/// Single-connection in-memory pool; the database lives as long as the pool
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Create every table and index used by the accounting core
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    QuotaStore::new(pool.clone()).init_db().await?;
    TransactionLedger::new(pool.clone()).init_db().await?;
    Ok(())
}

/// UTC, microsecond precision, `Z` suffix: sorts lexically in time order
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QuotaError::Parse(format!("timestamp {:?}: {}", raw, e)))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| QuotaError::Parse(format!("date {:?}: {}", raw, e)))
}
