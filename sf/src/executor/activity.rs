//! ActivityExecutor - dispatches activity tasks to collaborators

use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::retry::RetryConfig;
use crate::clock::SharedClock;
use crate::collaborators::{CollaboratorError, Collaborators};
use crate::domain::{
    ActivityFailure, ActivityOutput, ActivityResult, ActivityTask, AgentOutput, ErrorClass, HistoryEvent, TaskInput,
    is_reserved_key,
};
use crate::state::{StateError, StateManager};

/// Faults that are not activity outcomes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("Malformed task {task_id}: {reason}")]
    MalformedTask { task_id: String, reason: String },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Executes activity tasks with timeout, classification and idempotency
#[derive(Clone)]
pub struct ActivityExecutor {
    collaborators: Collaborators,
    state: StateManager,
    clock: SharedClock,
    retry: RetryConfig,
}

impl ActivityExecutor {
    pub fn new(collaborators: Collaborators, state: StateManager, clock: SharedClock, retry: RetryConfig) -> Self {
        Self {
            collaborators,
            state,
            clock,
            retry,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run the next attempt of `task`
    ///
    /// `view` is the public session state handed to agents. Expected
    /// failures come back as `ActivityResult`; only a malformed task or an
    /// unreadable store is an error.
    pub async fn execute(&self, task: &ActivityTask, view: &Map<String, Value>) -> Result<ActivityResult, ExecutorError> {
        debug!(task_id = %task.task_id, kind = %task.kind(), attempt_count = task.attempt_count, "execute: called");
        self.check_task(task)?;

        if let Some(record) = self.state.find_task_completion(&task.task_id).await? {
            let event = HistoryEvent::from_record(&record).map_err(StateError::from)?;
            if let HistoryEvent::ActivityCompleted {
                input_digest,
                output,
                attempt,
                ..
            } = event
            {
                if input_digest != task.input_digest {
                    warn!(task_id = %task.task_id, "Idempotency key reused with a different input");
                    return Ok(ActivityResult::Failed {
                        failure: ActivityFailure::new(
                            ErrorClass::Fatal,
                            format!("idempotency collision on task {}", task.task_id),
                        ),
                        attempts: task.attempt_count,
                    });
                }
                debug!(task_id = %task.task_id, "execute: returning recorded result");
                return Ok(ActivityResult::Succeeded {
                    output,
                    attempts: attempt,
                    replayed: true,
                });
            }
        }

        let attempt = task.attempt_count + 1;
        let timeout = Duration::from_millis(task.timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.invoke(task, view)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollaboratorError::Timeout(timeout)),
        };

        let result = match outcome.and_then(validate_output) {
            Ok(output) => {
                debug!(task_id = %task.task_id, attempt, "execute: succeeded");
                ActivityResult::Succeeded {
                    output,
                    attempts: attempt,
                    replayed: false,
                }
            }
            Err(err) => self.classify_failure(task, attempt, err),
        };
        Ok(result)
    }

    /// Run several tasks concurrently and join them in input order
    pub async fn execute_all(
        &self,
        tasks: &[ActivityTask],
        view: &Map<String, Value>,
        concurrency: usize,
    ) -> Result<Vec<ActivityResult>, ExecutorError> {
        debug!(count = tasks.len(), concurrency, "execute_all: called");
        let futs: Vec<_> = tasks.iter().map(|task| self.execute(task, view).boxed()).collect();
        let results: Vec<_> = stream::iter(futs)
            .buffered(concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    fn check_task(&self, task: &ActivityTask) -> Result<(), ExecutorError> {
        let malformed = |reason: &str| ExecutorError::MalformedTask {
            task_id: task.task_id.clone(),
            reason: reason.to_string(),
        };
        if task.task_id.is_empty() {
            return Err(malformed("empty task id"));
        }
        if task.max_attempts == 0 {
            return Err(malformed("max_attempts must be at least 1"));
        }
        if task.attempt_count >= task.max_attempts {
            return Err(malformed("attempts already exhausted"));
        }
        match &task.input {
            TaskInput::AgentCall { agent, .. } if !agent.is_domain() => Err(malformed("agent calls need a domain stage")),
            _ => Ok(()),
        }
    }

    async fn invoke(&self, task: &ActivityTask, view: &Map<String, Value>) -> Result<ActivityOutput, CollaboratorError> {
        match &task.input {
            TaskInput::AgentCall { agent, payload } => self
                .collaborators
                .agent
                .invoke(*agent, view, payload)
                .await
                .map(ActivityOutput::Agent),
            TaskInput::DataQuery { query } => self.collaborators.data.read(query).await.map(ActivityOutput::Rows),
            TaskInput::DataWrite { mutation } => self
                .collaborators
                .data
                .write(mutation, task.idempotency_key())
                .await
                .map(ActivityOutput::Receipt),
            TaskInput::Notify { recipient, message } => self
                .collaborators
                .notifier
                .send(recipient, message, task.idempotency_key())
                .await
                .map(ActivityOutput::Receipt),
            TaskInput::Search { query, filters, top_k } => self
                .collaborators
                .search
                .search(query, filters, *top_k)
                .await
                .map(ActivityOutput::Ranked),
        }
    }

    fn classify_failure(&self, task: &ActivityTask, attempt: u32, err: CollaboratorError) -> ActivityResult {
        let class = err.class();
        let failure = ActivityFailure::new(class, err.to_string());

        if class.is_retryable() && attempt < task.max_attempts {
            let policy = self.retry.policy_for(task.kind());
            let delay = policy.delay_for(attempt, err.retry_after());
            let retry_at = self.clock.now_ms() + delay.as_millis() as i64;
            info!(
                task_id = %task.task_id,
                attempt,
                max_attempts = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Activity failed, retry scheduled"
            );
            return ActivityResult::RetryScheduled {
                failure,
                attempts: attempt,
                retry_at,
            };
        }

        warn!(task_id = %task.task_id, attempt, class = %class, error = %err, "Activity failed");
        ActivityResult::Failed {
            failure,
            attempts: attempt,
        }
    }
}

/// Reject agent updates that would touch engine-owned or unnamed fields
fn validate_output(output: ActivityOutput) -> Result<ActivityOutput, CollaboratorError> {
    if let ActivityOutput::Agent(AgentOutput { updates, .. }) = &output {
        for key in updates.keys() {
            if key.trim().is_empty() {
                return Err(CollaboratorError::InvalidOutput("update with an empty field name".to_string()));
            }
            if is_reserved_key(key) {
                return Err(CollaboratorError::InvalidOutput(format!("update to reserved field {key}")));
            }
        }
    }
    Ok(output)
}
