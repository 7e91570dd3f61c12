//! Event types for workflow activity streaming
//!
//! Events describe what already happened and was made durable. They are
//! notifications for the runner and observers, never a source of truth.

use serde::{Deserialize, Serialize};

use crate::domain::{ActivityKind, SignalKind, Stage};

/// The vocabulary of observable workflow activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    /// A new instance (or generation) was created
    InstanceStarted { instance_id: String, generation: u32 },

    /// A signal was durably enqueued
    SignalAccepted {
        instance_id: String,
        signal_id: String,
        kind: SignalKind,
    },

    /// A turn's activities were recorded and handed to the executor
    TurnDispatched {
        instance_id: String,
        turn_id: String,
        stage: Stage,
        tasks: usize,
    },

    /// One activity branch finished (successfully or not)
    ActivityFinished {
        instance_id: String,
        task_id: String,
        kind: ActivityKind,
        success: bool,
        attempts: u32,
    },

    /// A state transition committed
    StageCommitted {
        instance_id: String,
        from: Stage,
        to: Stage,
        version: u64,
    },

    /// The instance parked until something external happens
    Suspended { instance_id: String, reason: String },

    /// A ticket was created for human follow-up
    Escalated { instance_id: String, ticket_id: String },
}

impl FlowEvent {
    /// Instance this event belongs to
    pub fn instance_id(&self) -> &str {
        match self {
            FlowEvent::InstanceStarted { instance_id, .. }
            | FlowEvent::SignalAccepted { instance_id, .. }
            | FlowEvent::TurnDispatched { instance_id, .. }
            | FlowEvent::ActivityFinished { instance_id, .. }
            | FlowEvent::StageCommitted { instance_id, .. }
            | FlowEvent::Suspended { instance_id, .. }
            | FlowEvent::Escalated { instance_id, .. } => instance_id,
        }
    }

    /// Short event name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::InstanceStarted { .. } => "InstanceStarted",
            FlowEvent::SignalAccepted { .. } => "SignalAccepted",
            FlowEvent::TurnDispatched { .. } => "TurnDispatched",
            FlowEvent::ActivityFinished { .. } => "ActivityFinished",
            FlowEvent::StageCommitted { .. } => "StageCommitted",
            FlowEvent::Suspended { .. } => "Suspended",
            FlowEvent::Escalated { .. } => "Escalated",
        }
    }

    /// Whether the runner should schedule the instance in response
    pub fn wakes_instance(&self) -> bool {
        matches!(
            self,
            FlowEvent::InstanceStarted { .. } | FlowEvent::SignalAccepted { .. }
        )
    }
}
