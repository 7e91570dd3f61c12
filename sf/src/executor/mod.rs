//! Activity execution
//!
//! Runs one attempt of an activity against its collaborator, classifies the
//! outcome and, for retryable failures, computes when the next attempt is
//! due. Completed side effects are never repeated: a task id with a recorded
//! completion returns the stored output.

mod activity;
mod retry;

pub use activity::{ActivityExecutor, ExecutorError};
pub use retry::{RetryConfig, RetryPolicy};
