//! Collaborator error types

use std::time::Duration;
use thiserror::Error;

use crate::domain::ErrorClass;

/// Errors reported by external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl CollaboratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CollaboratorError::Timeout(_) | CollaboratorError::RateLimited { .. } | CollaboratorError::Unavailable(_) => {
                ErrorClass::Transient
            }
            CollaboratorError::Rejected { status, .. } if *status >= 500 => ErrorClass::Transient,
            CollaboratorError::Rejected { .. } => ErrorClass::Permanent,
            CollaboratorError::InvalidOutput(_) => ErrorClass::Validation,
            CollaboratorError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Minimum wait requested by the collaborator
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CollaboratorError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
