//! Per-user daily quota accounting
//!
//! - Durable day records with a fixed allowance
//! - Atomic check-and-consume, audited on the ledger
//! - Administrative and daily resets

pub mod accountant;
pub mod locks;
pub mod store;
pub mod types;

pub use accountant::QuotaAccountant;
pub use locks::UserLocks;
pub use store::QuotaStore;
pub use types::{
    usage_percent, ConsumeOutcome, DailySnapshot, QuotaRecord, UsageCharge, UsageKind,
    UsageStatistics, UserId, MAX_USER_ID_LEN,
};
