use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use super::types::{LedgerCounts, LedgerEntry, LedgerFilter, LedgerOutcome, NewLedgerEntry};
use crate::db::{format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::quota::types::{units_from_db, units_to_db};
use crate::quota::{UsageKind, UserId};

/// Ledger storage
#[derive(Clone)]
pub struct TransactionLedger {
    db: SqlitePool,
}

impl TransactionLedger {
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
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                kind TEXT,
                description TEXT NOT NULL,
                input_units INTEGER,
                output_units INTEGER,
                request_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_user_created ON ledger_entries(user_id, created_at)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Append one entry; returns its id
    pub async fn append(&self, conn: &mut SqliteConnection, entry: &NewLedgerEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                user_id, amount, outcome, kind, description,
                input_units, output_units, request_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.user_id.as_str())
        .bind(units_to_db(entry.amount)?)
        .bind(entry.outcome.as_str())
        .bind(entry.kind.map(|k| k.as_str()))
        .bind(&entry.description)
        .bind(entry.input_units.map(units_to_db).transpose()?)
        .bind(entry.output_units.map(units_to_db).transpose()?)
        .bind(entry.request_id.as_deref())
        .bind(format_timestamp(entry.created_at))
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Latest `limit` entries, newest first
    pub async fn recent(&self, user_id: &UserId, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.query(user_id, &LedgerFilter::latest(limit)).await
    }

    /// Entries matching `filter`, newest first
    pub async fn query(&self, user_id: &UserId, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id, amount, outcome, kind, description, input_units, \
             output_units, request_id, created_at FROM ledger_entries WHERE user_id = ",
        );
        builder.push_bind(user_id.as_str().to_string());

        if let Some(outcome) = filter.outcome {
            builder.push(" AND outcome = ").push_bind(outcome.as_str());
        }
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ").push_bind(format_timestamp(since));
        }
        if let Some(until) = filter.until {
            builder.push(" AND created_at < ").push_bind(format_timestamp(until));
        }

        builder.push(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = builder.build().fetch_all(&self.db).await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Number of entries per outcome
    pub async fn counts(&self, user_id: &UserId) -> Result<LedgerCounts> {
        let rows = sqlx::query(
            "SELECT outcome, COUNT(*) AS n FROM ledger_entries WHERE user_id = ? GROUP BY outcome",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.db)
        .await?;

        let mut counts = LedgerCounts::default();
        for row in rows {
            let outcome: LedgerOutcome = row.try_get::<&str, _>("outcome")?.parse()?;
            let n = units_from_db(row.try_get("n")?)?;
            counts.total += n;
            match outcome {
                LedgerOutcome::Consumed => counts.consumed += n,
                LedgerOutcome::DeniedInsufficient | LedgerOutcome::DeniedRateLimited => {
                    counts.denied += n
                }
                LedgerOutcome::Reset => counts.reset += n,
            }
        }

        Ok(counts)
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<LedgerEntry> {
    let kind: Option<String> = row.try_get("kind")?;
    let input_units: Option<i64> = row.try_get("input_units")?;
    let output_units: Option<i64> = row.try_get("output_units")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: UserId::parse(row.try_get::<&str, _>("user_id")?)?,
        amount: units_from_db(row.try_get("amount")?)?,
        outcome: row.try_get::<&str, _>("outcome")?.parse()?,
        kind: kind.as_deref().map(str::parse::<UsageKind>).transpose()?,
        description: row.try_get("description")?,
        input_units: input_units.map(units_from_db).transpose()?,
        output_units: output_units.map(units_from_db).transpose()?,
        request_id: row.try_get("request_id")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::quota::UsageCharge;
    use chrono::{Duration, Utc};

    async fn setup() -> TransactionLedger {
        let pool = db::connect_in_memory().await.unwrap();
        let ledger = TransactionLedger::new(pool);
        ledger.init_db().await.unwrap();
        ledger
    }

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    async fn append(ledger: &TransactionLedger, entry: NewLedgerEntry) -> i64 {
        let mut conn = ledger.db.acquire().await.unwrap();
        ledger.append(&mut conn, &entry).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let ledger = setup().await;
        let charge = UsageCharge::from_breakdown(300, 200)
            .unwrap()
            .with_kind(UsageKind::PdfAnalysis)
            .with_description("PDF summary")
            .with_request_id("req-1");
        let now = Utc::now();

        let id = append(
            &ledger,
            NewLedgerEntry::for_charge(&user("alice"), &charge, LedgerOutcome::Consumed, now),
        )
        .await;

        let entries = ledger.recent(&user("alice"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.amount, 500);
        assert_eq!(entry.outcome, LedgerOutcome::Consumed);
        assert_eq!(entry.kind, Some(UsageKind::PdfAnalysis));
        assert_eq!(entry.input_units, Some(300));
        assert_eq!(entry.output_units, Some(200));
        assert_eq!(entry.request_id.as_deref(), Some("req-1"));
        // stored with microsecond precision
        assert!((entry.created_at - now).num_microseconds().unwrap().abs() < 1);
    }

    #[tokio::test]
    async fn test_recent_orders_newest_first_with_id_tiebreak() {
        let ledger = setup().await;
        let now = Utc::now();

        let first = append(&ledger, NewLedgerEntry::reset(&user("alice"), 0, "a", now)).await;
        let second = append(&ledger, NewLedgerEntry::reset(&user("alice"), 0, "b", now)).await;
        let older = append(
            &ledger,
            NewLedgerEntry::reset(&user("alice"), 0, "c", now - Duration::minutes(1)),
        )
        .await;

        let ids: Vec<i64> = ledger
            .recent(&user("alice"), 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![second, first, older]);

        assert_eq!(ledger.recent(&user("alice"), 2).await.unwrap().len(), 2);
        assert!(ledger.recent(&user("bob"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let ledger = setup().await;
        let now = Utc::now();
        let chat = UsageCharge::new(10).with_kind(UsageKind::Chat);
        let weather = UsageCharge::new(20).with_kind(UsageKind::WeatherChat);

        append(
            &ledger,
            NewLedgerEntry::for_charge(&user("alice"), &chat, LedgerOutcome::Consumed, now - Duration::hours(2)),
        )
        .await;
        append(
            &ledger,
            NewLedgerEntry::for_charge(&user("alice"), &weather, LedgerOutcome::Consumed, now),
        )
        .await;
        append(
            &ledger,
            NewLedgerEntry::for_charge(&user("alice"), &chat, LedgerOutcome::DeniedInsufficient, now),
        )
        .await;

        let filter = LedgerFilter {
            outcome: Some(LedgerOutcome::Consumed),
            ..Default::default()
        };
        assert_eq!(ledger.query(&user("alice"), &filter).await.unwrap().len(), 2);

        let filter = LedgerFilter {
            kind: Some(UsageKind::Chat),
            ..Default::default()
        };
        assert_eq!(ledger.query(&user("alice"), &filter).await.unwrap().len(), 2);

        let filter = LedgerFilter {
            since: Some(now - Duration::hours(1)),
            until: Some(now + Duration::seconds(1)),
            ..Default::default()
        };
        let recent = ledger.query(&user("alice"), &filter).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.created_at >= now - Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_counts() {
        let ledger = setup().await;
        let now = Utc::now();
        let chat = UsageCharge::new(10).with_kind(UsageKind::Chat);

        for outcome in [
            LedgerOutcome::Consumed,
            LedgerOutcome::Consumed,
            LedgerOutcome::DeniedInsufficient,
        ] {
            append(&ledger, NewLedgerEntry::for_charge(&user("alice"), &chat, outcome, now)).await;
        }
        append(&ledger, NewLedgerEntry::reset(&user("alice"), 20, "Manual reset", now)).await;

        let counts = ledger.counts(&user("alice")).await.unwrap();
        assert_eq!(
            counts,
            LedgerCounts {
                total: 4,
                consumed: 2,
                denied: 1,
                reset: 1,
            }
        );
        assert_eq!(ledger.counts(&user("bob")).await.unwrap(), LedgerCounts::default());
    }
}
