//! Deterministic reconstruction of an instance from its history
//!
//! The fold reads nothing but the events: no clock, no randomness, no store.
//! The engine uses the same fold to derive the snapshot it commits, so a
//! snapshot always equals the replay of the history written with it.

use serde_json::{Map, Value};
use sessionstore::HistoryRecord;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::{
    ActivityFailure, ActivityOutput, ActivityTask, ErrorClass, HistoryEvent, SessionState, Stage, TransitionRecord,
    TurnPlan,
};

/// History that cannot be folded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("Instance {0} has no start record")]
    NotStarted(String),

    #[error("Unreadable history record {sequence_no}: {message}")]
    Decode { sequence_no: u64, message: String },

    #[error("Transition at sequence {sequence_no} produced v{found}, expected v{expected}")]
    VersionGap { sequence_no: u64, expected: u64, found: u64 },

    #[error("Illegal transition {from} -> {to} at sequence {sequence_no}")]
    IllegalTransition { sequence_no: u64, from: Stage, to: Stage },

    #[error("Record {sequence_no} refers to task {task_id} outside the open turn")]
    UnknownTask { sequence_no: u64, task_id: String },

    #[error("Turn dispatched at sequence {sequence_no} while another turn is open")]
    TurnAlreadyOpen { sequence_no: u64 },
}

/// A dispatched turn that has not closed yet
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTurn {
    pub plan: TurnPlan,
    /// Successful outputs by task id
    pub completed: BTreeMap<String, ActivityOutput>,
    /// Attempts made so far by task id
    pub attempts: BTreeMap<String, u32>,
    /// Due time of the next attempt for branches awaiting a retry
    pub retry_at: BTreeMap<String, i64>,
    /// Latest failure by task id
    pub failures: BTreeMap<String, ActivityFailure>,
}

impl OpenTurn {
    fn new(plan: TurnPlan) -> Self {
        Self {
            plan,
            completed: BTreeMap::new(),
            attempts: BTreeMap::new(),
            retry_at: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Branch stopped retrying without succeeding
    pub fn gave_up(&self, task_id: &str) -> bool {
        !self.completed.contains_key(task_id) && self.failures.contains_key(task_id) && !self.retry_at.contains_key(task_id)
    }

    /// Branches that still need an attempt, with their attempt counts filled in
    pub fn pending_tasks(&self) -> Vec<ActivityTask> {
        self.plan
            .tasks
            .iter()
            .filter(|task| !self.completed.contains_key(&task.task_id) && !self.gave_up(&task.task_id))
            .map(|task| {
                let mut task = task.clone();
                task.attempt_count = self.attempts.get(&task.task_id).copied().unwrap_or(0);
                task
            })
            .collect()
    }

    /// Branches that gave up, with their last failure
    pub fn abandoned(&self) -> Vec<(&ActivityTask, &ActivityFailure)> {
        self.plan
            .tasks
            .iter()
            .filter(|task| self.gave_up(&task.task_id))
            .filter_map(|task| self.failures.get(&task.task_id).map(|failure| (task, failure)))
            .collect()
    }

    /// The fan-in barrier is reached: nothing left to run, or a required
    /// branch (or any fatal one) already failed for good
    pub fn is_settled(&self) -> bool {
        self.pending_tasks().is_empty()
            || self
                .abandoned()
                .iter()
                .any(|(task, failure)| task.required || failure.class == ErrorClass::Fatal)
    }

    /// Earliest due time among branches waiting to retry
    pub fn next_due(&self) -> Option<i64> {
        self.retry_at.values().min().copied()
    }
}

/// In-memory state of one instance generation
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub generation: u32,
    pub stage: Stage,
    pub version: u64,
    pub session_state: SessionState,
    pub consecutive_failures: u32,
    pub resume_stage: Option<Stage>,
    pub retry_not_before: Option<i64>,
    pub open_turn: Option<OpenTurn>,
    pub initial_context: Map<String, Value>,
    pub started_at: i64,
    pub updated_at: i64,
    /// Note carried by the latest transition
    pub last_note: Option<String>,
    /// Latest text reply from an agent
    pub last_reply: Option<String>,
    pub ticket_id: Option<String>,
}

impl WorkflowInstance {
    /// Fresh generation at version 0 in ONBOARDING
    pub fn started(
        instance_id: impl Into<String>,
        generation: u32,
        initial_context: Map<String, Value>,
        started_at: i64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            generation,
            stage: Stage::Onboarding,
            version: 0,
            session_state: SessionState::new(),
            consecutive_failures: 0,
            resume_stage: None,
            retry_not_before: None,
            open_turn: None,
            initial_context,
            started_at,
            updated_at: started_at,
            last_note: None,
            last_reply: None,
            ticket_id: None,
        }
    }

    /// Fold one event into the instance
    pub fn apply(&mut self, sequence_no: u64, event: HistoryEvent) -> Result<(), ReplayError> {
        match event {
            HistoryEvent::Started {
                generation,
                initial_context,
                started_at,
            } => {
                *self = Self::started(self.instance_id.clone(), generation, initial_context, started_at);
            }
            HistoryEvent::TurnDispatched { turn } => {
                if self.open_turn.is_some() {
                    return Err(ReplayError::TurnAlreadyOpen { sequence_no });
                }
                self.updated_at = turn.dispatched_at;
                self.open_turn = Some(OpenTurn::new(turn));
            }
            HistoryEvent::ActivityCompleted {
                task_id,
                attempt,
                output,
                ..
            } => {
                let open = self.open_task(sequence_no, &task_id)?;
                open.attempts.insert(task_id.clone(), attempt);
                open.retry_at.remove(&task_id);
                open.failures.remove(&task_id);
                if let ActivityOutput::Agent(agent) = &output {
                    if agent.reply.is_some() {
                        self.last_reply = agent.reply.clone();
                    }
                }
                if let Some(open) = self.open_turn.as_mut() {
                    open.completed.insert(task_id, output);
                }
            }
            HistoryEvent::ActivityFailed {
                task_id,
                attempt,
                failure,
                retry_at,
            } => {
                let open = self.open_task(sequence_no, &task_id)?;
                open.attempts.insert(task_id.clone(), attempt);
                match retry_at {
                    Some(at) => open.retry_at.insert(task_id.clone(), at),
                    None => open.retry_at.remove(&task_id),
                };
                open.failures.insert(task_id, failure);
            }
            HistoryEvent::Transition(record) => self.apply_transition(sequence_no, &record)?,
        }
        Ok(())
    }

    fn open_task(&mut self, sequence_no: u64, task_id: &str) -> Result<&mut OpenTurn, ReplayError> {
        let unknown = || ReplayError::UnknownTask {
            sequence_no,
            task_id: task_id.to_string(),
        };
        let open = self.open_turn.as_mut().ok_or_else(unknown)?;
        if open.plan.task(task_id).is_none() {
            return Err(unknown());
        }
        Ok(open)
    }

    /// Apply a committed transition; closes any open turn
    pub fn apply_transition(&mut self, sequence_no: u64, record: &TransitionRecord) -> Result<(), ReplayError> {
        if record.version != self.version + 1 {
            return Err(ReplayError::VersionGap {
                sequence_no,
                expected: self.version + 1,
                found: record.version,
            });
        }
        // an interrupt only closes back to the stage it left
        let skips_resume =
            self.stage == Stage::IdleInterrupt && record.to.is_domain() && Some(record.to) != self.resume_stage;
        if record.from != self.stage || !self.stage.can_transition_to(record.to) || skips_resume {
            return Err(ReplayError::IllegalTransition {
                sequence_no,
                from: record.from,
                to: record.to,
            });
        }
        self.session_state.apply(&record.writes, record.version);
        self.stage = record.to;
        self.version = record.version;
        self.consecutive_failures = record.consecutive_failures;
        self.resume_stage = record.resume_stage;
        self.retry_not_before = record.retry_not_before;
        self.last_note = record.note.clone();
        if record.ticket_id.is_some() {
            self.ticket_id = record.ticket_id.clone();
        }
        self.updated_at = record.committed_at;
        self.open_turn = None;
        Ok(())
    }
}

/// Rebuild the latest generation of `instance_id` from its history records
///
/// Records must be in sequence order. Folding starts at the last `Started`
/// record, so earlier generations are ignored.
pub fn replay(instance_id: &str, records: &[HistoryRecord]) -> Result<WorkflowInstance, ReplayError> {
    let start = records
        .iter()
        .rposition(|record| record.kind == "started")
        .ok_or_else(|| ReplayError::NotStarted(instance_id.to_string()))?;

    let mut instance = WorkflowInstance::started(instance_id, 0, Map::new(), 0);
    for record in &records[start..] {
        let event = HistoryEvent::from_record(record).map_err(|e| ReplayError::Decode {
            sequence_no: record.sequence_no,
            message: e.to_string(),
        })?;
        instance.apply(record.sequence_no, event)?;
    }
    Ok(instance)
}
