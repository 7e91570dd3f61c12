//! SessionStore - durable storage for long-running workflow instances
//!
//! A single SQLite database holds, per instance:
//! - the latest snapshot (stage, version, serialized state)
//! - the append-only activity history, ordered by `sequence_no`
//! - the inbound signal queue with deduplication
//! - the exclusive execution lease
//! - escalation tickets and the read-only projection used by queries
//!
//! The store is deliberately ignorant of workflow semantics. Record bodies are
//! JSON values owned by the caller; the store only enforces ordering, uniqueness,
//! lease ownership and compare-and-swap on `(generation, version)`.

mod error;
mod records;
mod store;

pub use error::StoreError;
pub use records::{
    CommitReceipt, CommitRequest, EnqueueOutcome, HistoryRecord, Lease, NewHistoryRecord, NewSignal,
    ProjectionRecord, SignalRecord, SignalStatus, SnapshotRecord, TicketRecord,
};
pub use store::Store;

/// Current time in unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
