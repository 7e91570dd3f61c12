//! Workflow engine
//!
//! `WorkflowClient` starts instances, delivers signals and serves queries.
//! `WorkflowEngine` runs instances forward under a lease, recording every
//! step in history so a crashed run can be replayed exactly.

mod client;
mod driver;
mod error;
mod escalation;
mod replay;
mod view;

#[cfg(test)]
mod tests;

pub use client::{HistoryEntry, TicketEntry, WorkflowClient};
pub use driver::{RunOutcome, Suspension, WorkflowEngine};
pub use error::EngineError;
pub use escalation::{EscalationManager, FailureVerdict};
pub use replay::{OpenTurn, ReplayError, WorkflowInstance, replay};
pub use view::{InstanceHandle, OPERATOR_MESSAGE, WorkflowInstanceView};
