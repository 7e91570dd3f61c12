//! Read models: snapshot bodies and the query projection

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sessionstore::{ProjectionRecord, SnapshotRecord};

use super::replay::WorkflowInstance;
use crate::domain::Stage;

/// Shown while an operator owns the session
pub const OPERATOR_MESSAGE: &str = "We are looking into this. Someone from our team will follow up shortly.";

/// Identity and position of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub generation: u32,
    pub stage: Stage,
    pub version: u64,
}

/// Read-only view of an instance, served without taking the lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceView {
    pub instance_id: String,
    pub generation: u32,
    pub version: u64,
    pub stage: Stage,
    #[serde(default)]
    pub resume_stage: Option<Stage>,
    /// Public session fields
    pub session_state: Map<String, Value>,
    pub consecutive_failures: u32,
    /// Stable user-facing status line
    pub status: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub retry_not_before: Option<i64>,
    /// A turn is dispatched and has not closed
    #[serde(default)]
    pub turn_open: bool,
    pub updated_at: i64,
}

impl WorkflowInstanceView {
    pub fn of(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            generation: instance.generation,
            version: instance.version,
            stage: instance.stage,
            resume_stage: instance.resume_stage,
            session_state: instance.session_state.public_view(),
            consecutive_failures: instance.consecutive_failures,
            status: status_line(instance.stage, instance.last_note.as_deref()),
            note: instance.last_note.clone(),
            reply: instance.last_reply.clone(),
            ticket_id: instance.ticket_id.clone(),
            retry_not_before: instance.retry_not_before,
            turn_open: instance.open_turn.is_some(),
            updated_at: instance.updated_at,
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            instance_id: self.instance_id.clone(),
            generation: self.generation,
            stage: self.stage,
            version: self.version,
        }
    }
}

fn status_line(stage: Stage, note: Option<&str>) -> String {
    match stage {
        Stage::Escalated | Stage::Failed => OPERATOR_MESSAGE.to_string(),
        Stage::Completed => "Your plan is complete.".to_string(),
        Stage::IdleInterrupt => "Answering a side question.".to_string(),
        _ => match note {
            Some(note) => note.to_string(),
            None => format!("Working on {}.", stage.as_str().to_ascii_lowercase()),
        },
    }
}

pub(crate) fn snapshot_record(instance: &WorkflowInstance) -> Result<SnapshotRecord, serde_json::Error> {
    Ok(SnapshotRecord {
        instance_id: instance.instance_id.clone(),
        generation: instance.generation,
        version: instance.version,
        stage: instance.stage.as_str().to_string(),
        terminal: instance.stage.is_terminal(),
        body: serde_json::to_value(WorkflowInstanceView::of(instance))?,
        updated_at: instance.updated_at,
    })
}

pub(crate) fn projection_record(instance: &WorkflowInstance) -> Result<ProjectionRecord, serde_json::Error> {
    Ok(ProjectionRecord {
        instance_id: instance.instance_id.clone(),
        generation: instance.generation,
        version: instance.version,
        body: serde_json::to_value(WorkflowInstanceView::of(instance))?,
        updated_at: instance.updated_at,
    })
}
