//! External collaborators
//!
//! The engine talks to the outside world only through these traits: the
//! per-stage reasoning agent, the domain data store, vendor search, user
//! notification and the human escalation queue. Implementations must be
//! safe to call concurrently; writes and notifications receive an
//! idempotency key and must honor it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::domain::{AgentOutput, EscalationTicket, Stage};

mod error;
pub mod mock;

pub use error::CollaboratorError;

/// Stage-specific reasoning agent
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Process a signal payload for `stage` given the current session fields
    async fn invoke(
        &self,
        stage: Stage,
        session_state: &Map<String, Value>,
        payload: &Value,
    ) -> Result<AgentOutput, CollaboratorError>;
}

/// Persistent domain data (profiles, budgets, shortlists)
#[async_trait]
pub trait DomainDataStore: Send + Sync {
    async fn read(&self, query: &Value) -> Result<Vec<Value>, CollaboratorError>;

    /// Apply a mutation; repeating an idempotency key must not apply it twice
    async fn write(&self, mutation: &Value, idempotency_key: &str) -> Result<Value, CollaboratorError>;
}

/// Ranked vendor search
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, query: &str, filters: &Value, top_k: usize) -> Result<Vec<Value>, CollaboratorError>;
}

/// Outbound user notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, message: &str, idempotency_key: &str) -> Result<Value, CollaboratorError>;
}

/// Human operator queue
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// Returns the sink's reference for the ticket; must be idempotent on `ticket_id`
    async fn create_ticket(&self, ticket: &EscalationTicket) -> Result<String, CollaboratorError>;
}

/// Everything the engine calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn ReasoningAgent>,
    pub data: Arc<dyn DomainDataStore>,
    pub search: Arc<dyn SearchService>,
    pub notifier: Arc<dyn Notifier>,
    pub escalation: Arc<dyn EscalationSink>,
}
