//! History events: the authoritative record of an instance
//!
//! Replaying the events of a generation in sequence order rebuilds the exact
//! instance state. Every nondeterministic input (timestamps, retry due times,
//! activity outputs) is stored in the event that introduced it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sessionstore::{HistoryRecord, NewHistoryRecord};

use super::activity::{ActivityFailure, ActivityOutput};
use super::stage::Stage;
use super::state::FieldWrite;
use super::turn::TurnPlan;

/// A committed stage transition and everything it changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    /// Version this transition produced
    pub version: u64,
    #[serde(default)]
    pub writes: Vec<FieldWrite>,
    /// Signals acknowledged by this transition
    #[serde(default)]
    pub consumed_signals: Vec<String>,
    pub consecutive_failures: u32,
    /// Stage to return to when leaving IDLE_INTERRUPT
    #[serde(default)]
    pub resume_stage: Option<Stage>,
    /// Earliest time the next turn may be dispatched
    #[serde(default)]
    pub retry_not_before: Option<i64>,
    /// Human-readable reason (clarification request, failure, escalation)
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub committed_at: i64,
}

/// One entry in an instance's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Opens a generation at version 0 in ONBOARDING
    Started {
        generation: u32,
        #[serde(default)]
        initial_context: Map<String, Value>,
        started_at: i64,
    },
    TurnDispatched { turn: TurnPlan },
    ActivityCompleted {
        task_id: String,
        attempt: u32,
        input_digest: String,
        output: ActivityOutput,
    },
    ActivityFailed {
        task_id: String,
        attempt: u32,
        failure: ActivityFailure,
        /// Due time of the next attempt; `None` when the branch gave up
        #[serde(default)]
        retry_at: Option<i64>,
    },
    Transition(TransitionRecord),
}

impl HistoryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEvent::Started { .. } => "started",
            HistoryEvent::TurnDispatched { .. } => "turn_dispatched",
            HistoryEvent::ActivityCompleted { .. } => "activity_completed",
            HistoryEvent::ActivityFailed { .. } => "activity_failed",
            HistoryEvent::Transition(_) => "transition",
        }
    }

    /// Task id indexed for idempotency lookups (successful completions only)
    pub fn completed_task_id(&self) -> Option<&str> {
        match self {
            HistoryEvent::ActivityCompleted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    pub fn to_record(&self, recorded_at: i64) -> Result<NewHistoryRecord, serde_json::Error> {
        Ok(NewHistoryRecord {
            kind: self.kind().to_string(),
            task_id: self.completed_task_id().map(String::from),
            payload: serde_json::to_value(self)?,
            recorded_at,
        })
    }

    pub fn from_record(record: &HistoryRecord) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record.payload.clone())
    }
}
