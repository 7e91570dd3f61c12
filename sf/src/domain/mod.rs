//! Domain types for SessionFlow
//!
//! Stages, session state, signals, activities, turns, history events and
//! escalation tickets. Everything persisted goes through serde into the
//! session store as JSON.

mod activity;
mod history;
mod id;
mod signal;
mod stage;
mod state;
mod ticket;
mod turn;

pub use activity::{
    ActivityFailure, ActivityKind, ActivityOutput, ActivityResult, ActivityTask, AgentOutput, ErrorClass, NextHint,
    OutputTarget, TaskInput,
};
pub use history::{HistoryEvent, TransitionRecord};
pub use id::{digest_json, exit_key, instance_id_for_session, lease_token, task_id, turn_id, worker_id};
pub use signal::{Signal, SignalKind};
pub use stage::Stage;
pub use state::{FieldEntry, FieldRevision, FieldWrite, RESERVED_PREFIX, SessionState, is_reserved_key};
pub use ticket::EscalationTicket;
pub use turn::{TurnKind, TurnPlan};
