//! CLI tool for inspecting and adjusting user quotas
//!
//! # Usage
//!
//! ```bash
//! # Today's usage for a user
//! quota-admin snapshot 42 --db sqlite://quota.db
//!
//! # Last week, newest first
//! quota-admin history 42 --days 7
//!
//! # Latest ledger entries, as JSON
//! quota-admin --json ledger 42 --limit 20
//!
//! # Give a user their full allowance back
//! quota-admin reset 42
//!
//! # Run the daily sweep now
//! quota-admin sweep
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use quota_rs::clock::SystemClock;
use quota_rs::config::Config;
use quota_rs::ledger::{LedgerFilter, LedgerOutcome};
use quota_rs::quota::UsageKind;
use quota_rs::{db, DailyResetScheduler, QuotaFacade};
use serde::Serialize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quota-admin")]
#[command(about = "Inspect and adjust daily usage quotas", long_about = None)]
struct Cli {
    /// Configuration file (QUOTA__* environment variables still apply)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL, overrides the configuration (e.g., sqlite://quota.db)
    #[arg(short, long)]
    db: Option<String>,

    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Today's usage for a user
    Snapshot {
        /// User identifier
        user: String,
    },
    /// Daily usage, newest first
    History {
        /// User identifier
        user: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Ledger entries, newest first
    Ledger {
        /// User identifier
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Only this outcome (e.g., CONSUMED, RESET)
        #[arg(long)]
        outcome: Option<LedgerOutcome>,
        /// Only this usage kind (e.g., chat, pdf-analysis)
        #[arg(long)]
        kind: Option<UsageKind>,
    },
    /// Usage statistics for a user
    Stats {
        /// User identifier
        user: String,
    },
    /// Restore today's full allowance
    Reset {
        /// User identifier
        user: String,
    },
    /// Roll every stale user forward to today
    Sweep {
        /// Keep yesterday's row and insert a new one
        #[arg(long)]
        preserve_history: bool,
    },
    /// Charge units as a collaborator would
    Consume {
        /// User identifier
        user: String,
        /// Units to charge
        cost: u64,
        #[arg(long, default_value = "chat")]
        kind: UsageKind,
        #[arg(long, default_value = "Charged from quota-admin")]
        description: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config))?;
    if let Some(db) = cli.db {
        config.storage.database_url = db;
    }

    let pool = db::connect(&config.storage.database_url, config.storage.max_connections).await?;
    db::init_schema(&pool).await?;
    let facade = QuotaFacade::from_config(&config, pool, Arc::new(SystemClock))?;

    match cli.command {
        Commands::Snapshot { user } => {
            let snapshot = facade.daily_snapshot(&user).await?;
            if cli.json {
                return print_json(&snapshot);
            }
            println!("User:      {}", snapshot.user_id);
            println!("Date:      {}", snapshot.usage_date);
            println!("Used:      {}", snapshot.used);
            println!("Remaining: {}", snapshot.remaining);
            println!("Limit:     {}", snapshot.limit);
            println!("Usage:     {:.1}%", snapshot.percent_used);
        }
        Commands::History { user, days } => {
            let history = facade.history(&user, days).await?;
            if cli.json {
                return print_json(&history);
            }
            if history.is_empty() {
                println!("No usage recorded.");
            } else {
                println!("{:<12} {:>12} {:>12} {:>12} {:>8}", "Date", "Used", "Remaining", "Limit", "Usage");
                println!("{:-<60}", "");
                for day in &history {
                    println!(
                        "{:<12} {:>12} {:>12} {:>12} {:>7.1}%",
                        day.usage_date, day.used, day.remaining, day.limit, day.percent_used
                    );
                }
            }
        }
        Commands::Ledger {
            user,
            limit,
            outcome,
            kind,
        } => {
            let filter = LedgerFilter {
                outcome,
                kind,
                limit: Some(limit),
                ..Default::default()
            };
            let entries = facade.ledger_filtered(&user, &filter).await?;
            if cli.json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("No ledger entries.");
            } else {
                println!("{:<28} {:<20} {:>10} {:<15} {}", "Created At", "Outcome", "Amount", "Kind", "Description");
                println!("{:-<100}", "");
                for entry in &entries {
                    let kind = entry.kind.map(|k| k.as_str()).unwrap_or("-");
                    println!(
                        "{:<28} {:<20} {:>10} {:<15} {}",
                        entry.created_at.to_rfc3339(),
                        entry.outcome.as_str(),
                        entry.amount,
                        kind,
                        entry.description
                    );
                }
                println!("\nTotal: {} entry(ies)", entries.len());
            }
        }
        Commands::Stats { user } => {
            let stats = facade.statistics(&user).await?;
            if cli.json {
                return print_json(&stats);
            }
            println!("User:          {}", stats.today.user_id);
            println!("Today:         {} / {} ({:.1}%)", stats.today.used, stats.daily_limit, stats.today.percent_used);
            println!("Average/day:   {:.0}", stats.average_daily_usage);
            println!("Days recorded: {}", stats.history_days);
            println!(
                "Ledger:        {} entries ({} consumed, {} denied, {} resets)",
                stats.ledger_total, stats.consumed_count, stats.denied_count, stats.reset_count
            );
        }
        Commands::Reset { user } => {
            let record = facade.admin_reset(&user).await?;
            if cli.json {
                return print_json(&record);
            }
            println!("✓ Quota for {} reset to {} units", record.user_id, record.tokens_remaining);
        }
        Commands::Sweep { preserve_history } => {
            let scheduler = DailyResetScheduler::from_config(Arc::clone(facade.accountant()), &config.scheduler)?
                .with_preserve_history(preserve_history || config.scheduler.preserve_history);
            let report = scheduler.run_once().await?;
            if cli.json {
                return print_json(&report);
            }
            println!(
                "Examined {}, reset {}, skipped {}, failed {}",
                report.examined,
                report.reset,
                report.skipped,
                report.failed.len()
            );
            for failure in &report.failed {
                eprintln!("✗ {}: {}", failure.user_id, failure.error);
            }
            if !report.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Consume {
            user,
            cost,
            kind,
            description,
        } => {
            let decision = facade.check_and_consume(&user, cost, kind, &description).await?;
            if cli.json {
                return print_json(&decision);
            }
            if decision.allowed {
                println!("✓ Charged {} units, {} remaining", cost, decision.remaining);
            } else {
                println!("✗ Denied ({:?}), {} remaining", decision.reason, decision.remaining);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
