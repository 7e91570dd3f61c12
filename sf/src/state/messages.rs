//! State manager messages
//!
//! Commands and responses for the actor pattern.

use sessionstore::{
    CommitReceipt, CommitRequest, EnqueueOutcome, HistoryRecord, Lease, NewHistoryRecord, NewSignal, ProjectionRecord,
    SignalRecord, SnapshotRecord, StoreError, TicketRecord,
};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from state operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Instance {0} already exists")]
    AlreadyExists(String),

    #[error("Lease on {instance_id} held by {owner} until {expires_at}")]
    LeaseHeld {
        instance_id: String,
        owner: String,
        expires_at: i64,
    },

    #[error("Lease on {0} was lost")]
    LeaseLost(String),

    #[error("Version conflict on {instance_id}: expected v{expected}, found v{actual}")]
    Conflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Task {0} already completed")]
    DuplicateTask(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Channel error")]
    ChannelError,
}

impl StateError {
    /// Lost a compare-and-swap race; re-reading and retrying may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. } | StateError::DuplicateTask(_))
    }
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => StateError::AlreadyExists(id),
            StoreError::NotFound(id) => StateError::NotFound(id),
            StoreError::LeaseHeld {
                instance_id,
                owner,
                expires_at,
            } => StateError::LeaseHeld {
                instance_id,
                owner,
                expires_at,
            },
            StoreError::LeaseLost(id) => StateError::LeaseLost(id),
            StoreError::VersionConflict {
                instance_id,
                expected_version,
                actual_version,
                ..
            } => StateError::Conflict {
                instance_id,
                expected: expected_version,
                actual: actual_version,
            },
            StoreError::DuplicateTask(task_id) => StateError::DuplicateTask(task_id),
            StoreError::Serialization(e) => StateError::DeserializationError(e.to_string()),
            other => StateError::StoreError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::DeserializationError(err.to_string())
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Instances
    CreateInstance {
        snapshot: SnapshotRecord,
        history: Vec<NewHistoryRecord>,
        reply: oneshot::Sender<StateResponse<CommitReceipt>>,
    },
    LoadSnapshot {
        instance_id: String,
        reply: oneshot::Sender<StateResponse<Option<SnapshotRecord>>>,
    },
    ListSnapshots {
        include_terminal: bool,
        reply: oneshot::Sender<StateResponse<Vec<SnapshotRecord>>>,
    },

    // History
    ReadHistory {
        instance_id: String,
        generation: Option<u32>,
        reply: oneshot::Sender<StateResponse<Vec<HistoryRecord>>>,
    },
    FindTaskCompletion {
        task_id: String,
        reply: oneshot::Sender<StateResponse<Option<HistoryRecord>>>,
    },

    // Leases and commits
    AcquireLease {
        instance_id: String,
        owner: String,
        token: String,
        now: i64,
        ttl_ms: i64,
        reply: oneshot::Sender<StateResponse<Lease>>,
    },
    RenewLease {
        lease: Lease,
        now: i64,
        ttl_ms: i64,
        reply: oneshot::Sender<StateResponse<i64>>,
    },
    ReleaseLease {
        lease: Lease,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    Commit {
        request: CommitRequest,
        reply: oneshot::Sender<StateResponse<CommitReceipt>>,
    },

    // Signals
    EnqueueSignal {
        signal: NewSignal,
        capacity: usize,
        reply: oneshot::Sender<StateResponse<EnqueueOutcome>>,
    },
    PendingSignals {
        instance_id: String,
        reply: oneshot::Sender<StateResponse<Vec<SignalRecord>>>,
    },
    DropSignal {
        instance_id: String,
        signal_id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },

    // Tickets
    ListTickets {
        instance_id: Option<String>,
        undelivered_only: bool,
        reply: oneshot::Sender<StateResponse<Vec<TicketRecord>>>,
    },
    MarkTicketDelivered {
        ticket_id: String,
        now: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Projections
    PutProjection {
        projection: ProjectionRecord,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    LoadProjection {
        instance_id: String,
        reply: oneshot::Sender<StateResponse<Option<ProjectionRecord>>>,
    },

    // Shutdown
    Shutdown,
}
