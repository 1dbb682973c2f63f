//! Append-only audit ledger
//!
//! Every accounting decision (consume, budget denial, reset) is written
//! exactly once and never updated or deleted.

pub mod store;
pub mod types;

pub use store::TransactionLedger;
pub use types::{LedgerCounts, LedgerEntry, LedgerFilter, LedgerOutcome, NewLedgerEntry};
