//! Store errors

use thiserror::Error;

/// Errors returned by [`crate::Store`] operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Instance {0} already exists and is not terminal")]
    AlreadyExists(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Lease on {instance_id} held by {owner} until {expires_at}")]
    LeaseHeld {
        instance_id: String,
        owner: String,
        expires_at: i64,
    },

    #[error("Lease on {0} is no longer held by this owner")]
    LeaseLost(String),

    #[error(
        "Version conflict on {instance_id}: expected {expected_generation}/{expected_version}, found {actual_generation}/{actual_version}"
    )]
    VersionConflict {
        instance_id: String,
        expected_generation: u32,
        expected_version: u64,
        actual_generation: u32,
        actual_version: u64,
    },

    #[error("Task {0} already has a recorded completion")]
    DuplicateTask(String),

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
