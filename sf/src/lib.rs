//! SessionFlow - durable multi-stage workflow engine
//!
//! SessionFlow moves a planning session through ONBOARDING, PREFERENCES,
//! BUDGET and VENDOR to COMPLETED. Users may interrupt at any point with
//! off-stage questions, and every step survives process crashes.
//!
//! # Core Concepts
//!
//! - **History is the truth**: every step is appended to history before it
//!   takes effect; a restarted run replays history to the exact same state
//! - **Committed transitions**: a stage change, its field writes and its
//!   signal acknowledgements land in one atomic, versioned commit
//! - **At-most-once effects**: side-effecting activities carry idempotency
//!   keys derived from the instance, generation and branch; stage exits key
//!   on the stage so a re-dispatched exit reuses its key
//! - **Escalation, not crashes**: repeated failures hand the session to a
//!   human with its context attached
//!
//! # Modules
//!
//! - [`domain`] - Stages, signals, activities, history events
//! - [`collaborators`] - Traits for the agent, data store, search, notifier, ticket sink
//! - [`executor`] - Activity execution with retry and timeouts
//! - [`router`] - Chooses the next step from stage, session fields and signal
//! - [`signals`] - Durable per-instance signal queues
//! - [`engine`] - Workflow engine, replay, escalation and queries
//! - [`runner`] - Keeps many instances moving concurrently
//! - [`state`] - Async actor over the session store
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod executor;
pub mod router;
pub mod runner;
pub mod signals;
pub mod state;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{
    CollaboratorError, Collaborators, DomainDataStore, EscalationSink, Notifier, ReasoningAgent, SearchService,
};
pub use config::{Config, EngineConfig, RunnerConfig, SignalConfig, StorageConfig};
pub use domain::{
    ActivityFailure, ActivityKind, ActivityOutput, ActivityTask, AgentOutput, ErrorClass, EscalationTicket,
    HistoryEvent, NextHint, Signal, SignalKind, Stage, instance_id_for_session,
};
pub use engine::{
    EngineError, EscalationManager, HistoryEntry, InstanceHandle, RunOutcome, Suspension, TicketEntry,
    WorkflowClient, WorkflowEngine, WorkflowInstanceView, replay,
};
pub use events::{EventBus, FlowEvent};
pub use executor::{ActivityExecutor, RetryConfig, RetryPolicy};
pub use router::RouterRules;
pub use runner::WorkflowRunner;
pub use signals::{SignalBus, SignalOutcome};
pub use state::{RecoveryStats, StateError, StateManager, scan_for_recovery};
