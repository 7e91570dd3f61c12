//! Record types persisted by the store

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Latest materialized state of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub instance_id: String,
    /// Incremented each time a terminal instance is restarted
    pub generation: u32,
    /// Number of committed transitions in this generation
    pub version: u64,
    /// Stage name, kept as a column so listings do not parse the body
    pub stage: String,
    pub terminal: bool,
    /// Caller-owned serialized instance state
    pub body: Value,
    pub updated_at: i64,
}

/// One persisted history event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub instance_id: String,
    pub sequence_no: u64,
    pub generation: u32,
    /// Instance version the event belongs to
    pub version: u64,
    pub kind: String,
    /// Set only for successful activity completions; unique across the store
    pub task_id: Option<String>,
    pub payload: Value,
    pub recorded_at: i64,
}

/// History event to append; sequence, generation and version are assigned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    pub kind: String,
    pub task_id: Option<String>,
    pub payload: Value,
    pub recorded_at: i64,
}

/// Delivery state of a queued signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Acked,
    Dropped,
}

impl SignalStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Acked => "acked",
            SignalStatus::Dropped => "dropped",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "acked" => SignalStatus::Acked,
            "dropped" => SignalStatus::Dropped,
            _ => SignalStatus::Pending,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signal offered to the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub instance_id: String,
    /// Deduplication key supplied by the sender
    pub signal_id: String,
    /// Critical signals are never dropped and drain first
    pub critical: bool,
    pub payload: Value,
    pub received_at: i64,
}

/// Queued signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub instance_id: String,
    pub signal_id: String,
    /// Arrival order within the instance
    pub seq: u64,
    pub critical: bool,
    pub status: SignalStatus,
    pub payload: Value,
    pub received_at: i64,
}

/// Result of offering a signal to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored; `dropped` names the oldest non-critical signal evicted to make room
    Accepted { seq: u64, dropped: Option<String> },
    /// A signal with the same id was already received
    Duplicate,
    /// Queue full of critical signals; the incoming non-critical signal was discarded
    Rejected,
}

/// Escalation ticket stored with the commit that created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub ticket_id: String,
    pub instance_id: String,
    pub body: Value,
    pub created_at: i64,
    /// Set once the external sink acknowledged the ticket
    pub delivered_at: Option<i64>,
}

/// Read-only view published after commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub instance_id: String,
    pub generation: u32,
    pub version: u64,
    pub body: Value,
    pub updated_at: i64,
}

/// Exclusive right to advance one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub instance_id: String,
    pub owner: String,
    /// Unique per acquisition; commits must present it
    pub token: String,
    pub expires_at: i64,
}

/// Atomic unit of persistence for one engine step
///
/// Everything in a request lands in one SQLite transaction or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub instance_id: String,
    pub lease_token: String,
    pub expected_generation: u32,
    pub expected_version: u64,
    /// New snapshot; its version must be `expected_version + 1`.
    /// `None` appends history without advancing the version.
    pub snapshot: Option<SnapshotRecord>,
    pub history: Vec<NewHistoryRecord>,
    /// Signal ids moved from pending to acked
    pub ack_signals: Vec<String>,
    pub tickets: Vec<TicketRecord>,
    /// Commit time; the lease is extended from here
    pub now: i64,
    pub lease_ttl_ms: i64,
}

/// What a successful commit produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub version: u64,
    pub last_sequence_no: u64,
}
