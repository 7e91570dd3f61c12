//! Engine error types

use thiserror::Error;

use super::replay::ReplayError;
use crate::executor::ExecutorError;
use crate::router::RouterError;
use crate::state::StateError;

/// Errors surfaced by the workflow engine and client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Instance {0} not found")]
    NotFound(String),

    #[error("Instance {0} already exists and is not terminal")]
    AlreadyExists(String),

    #[error(transparent)]
    State(StateError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Invariant violated on {instance_id}: {message}")]
    Invariant { instance_id: String, message: String },
}

impl EngineError {
    /// Lost a compare-and-swap race on the instance
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::State(e) if e.is_conflict())
    }

    /// Faults that halt the instance and need an operator
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EngineError::Executor(ExecutorError::MalformedTask { .. })
                | EngineError::Invariant { .. }
                | EngineError::Encoding(_)
        )
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(id) => EngineError::NotFound(id),
            StateError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            other => EngineError::State(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Encoding(err.to_string())
    }
}
