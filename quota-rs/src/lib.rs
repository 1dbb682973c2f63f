//! quota-rs: usage-quota accounting and burst rate limiting
//!
//! Gates calls to a costly downstream service. Every user gets a daily unit
//! budget and a short-window request throttle, and every accounting decision
//! lands on an append-only ledger.
//!
//! # Features
//!
//! - **Daily budget**: atomic check-and-consume per user and calendar day
//! - **Burst limits**: sliding one-hour windows per user and endpoint class
//! - **Ledger**: durable audit trail of consumes, denials and resets
//! - **Daily sweep**: scheduled rollover of stale records
//!
//! # Example
//!
//! ```no_run
//! use quota_rs::clock::SystemClock;
//! use quota_rs::config::Config;
//! use quota_rs::quota::UsageKind;
//! use quota_rs::{db, QuotaFacade};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let pool = db::connect(&config.storage.database_url, config.storage.max_connections).await?;
//!     db::init_schema(&pool).await?;
//!
//!     let facade = QuotaFacade::from_config(&config, pool, Arc::new(SystemClock))?;
//!     let decision = facade
//!         .check_and_consume("42", 1200, UsageKind::Chat, "chat message")
//!         .await?;
//!
//!     if !decision.allowed {
//!         println!("Denied: {:?}", decision.reason);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`clock`]: Injectable time source
//! - [`quota`]: Day records and the accountant
//! - [`ledger`]: Append-only transaction ledger
//! - [`rate_limit`]: In-memory burst limiter
//! - [`scheduler`]: Daily reset sweep
//! - [`facade`]: Entry point for collaborators

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod facade;
pub mod ledger;
pub mod logging;
pub mod quota;
pub mod rate_limit;
pub mod scheduler;

pub use error::{QuotaError, Result};
pub use facade::{Decision, DenialReason, QuotaFacade, DEFAULT_ESTIMATED_COST};
pub use quota::QuotaAccountant;
pub use rate_limit::BurstRateLimiter;
pub use scheduler::DailyResetScheduler;
