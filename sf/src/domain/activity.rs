//! Activities: side-effecting calls to external collaborators

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::digest_json;
use super::stage::Stage;

/// Category of external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    AgentCall,
    DataQuery,
    DataWrite,
    Notify,
    Search,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActivityKind::AgentCall => "AGENT_CALL",
            ActivityKind::DataQuery => "DATA_QUERY",
            ActivityKind::DataWrite => "DATA_WRITE",
            ActivityKind::Notify => "NOTIFY",
            ActivityKind::Search => "SEARCH",
        };
        write!(f, "{name}")
    }
}

/// Everything needed to perform one activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskInput {
    /// Ask the stage agent to process a signal payload
    AgentCall { agent: Stage, payload: Value },
    DataQuery { query: Value },
    DataWrite { mutation: Value },
    Notify { recipient: String, message: String },
    Search { query: String, filters: Value, top_k: usize },
}

impl TaskInput {
    pub fn kind(&self) -> ActivityKind {
        match self {
            TaskInput::AgentCall { .. } => ActivityKind::AgentCall,
            TaskInput::DataQuery { .. } => ActivityKind::DataQuery,
            TaskInput::DataWrite { .. } => ActivityKind::DataWrite,
            TaskInput::Notify { .. } => ActivityKind::Notify,
            TaskInput::Search { .. } => ActivityKind::Search,
        }
    }

    /// Stable digest of the input, used to detect idempotency-key reuse
    pub fn digest(&self) -> String {
        match serde_json::to_value(self) {
            Ok(value) => digest_json(&value),
            Err(_) => String::new(),
        }
    }
}

/// Where a successful output lands in session state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum OutputTarget {
    /// Agent updates become field writes
    #[default]
    AgentUpdates,
    /// Whole output stored under one field
    Field(String),
    /// First row stored under the field; its keys seed fields not yet set
    FirstRow(String),
}

/// A materialized activity owned by a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Unique per instance generation, version and branch
    pub task_id: String,
    /// Key handed to side-effecting collaborators when it must outlive the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub input: TaskInput,
    #[serde(default)]
    pub target: OutputTarget,
    /// Whether the turn fails when this branch fails
    pub required: bool,
    /// Attempts already made
    #[serde(default)]
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub input_digest: String,
}

impl ActivityTask {
    pub fn new(task_id: impl Into<String>, input: TaskInput, max_attempts: u32, timeout_ms: u64) -> Self {
        let input_digest = input.digest();
        Self {
            task_id: task_id.into(),
            idempotency_key: None,
            input,
            target: OutputTarget::default(),
            required: true,
            attempt_count: 0,
            max_attempts,
            timeout_ms,
            input_digest,
        }
    }

    pub fn with_target(mut self, target: OutputTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Key for collaborator-side dedup; the task id unless overridden
    pub fn idempotency_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.task_id)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn kind(&self) -> ActivityKind {
        self.input.kind()
    }
}

/// How an activity failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, rate limits, unavailable collaborators
    Transient,
    /// Malformed or unusable output; ask the user to clarify
    Validation,
    /// Lost a race on persisted state
    Conflict,
    /// Rejected by the collaborator; retrying will not help
    Permanent,
    /// Invariant violation; escalate immediately
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Fatal => "fatal",
        };
        write!(f, "{name}")
    }
}

/// Agent guidance on what the flow should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextHint {
    #[default]
    Continue,
    StageComplete,
    /// The user gave up on the session
    Abandon,
}

/// Structured reply from a reasoning agent
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub updates: Map<String, Value>,
    #[serde(default)]
    pub next_hint: NextHint,
    /// Text shown to the user
    #[serde(default)]
    pub reply: Option<String>,
}

/// Successful activity output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ActivityOutput {
    Agent(AgentOutput),
    Rows(Vec<Value>),
    Receipt(Value),
    Ranked(Vec<Value>),
}

impl ActivityOutput {
    /// Value written to the task's output key
    pub fn as_field_value(&self) -> Value {
        match self {
            ActivityOutput::Agent(output) => Value::Object(output.updates.clone()),
            ActivityOutput::Rows(rows) | ActivityOutput::Ranked(rows) => Value::Array(rows.clone()),
            ActivityOutput::Receipt(receipt) => receipt.clone(),
        }
    }
}

/// Classified failure of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl ActivityFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityResult {
    /// `replayed` is set when the output came from history instead of a call
    Succeeded {
        output: ActivityOutput,
        attempts: u32,
        replayed: bool,
    },
    /// Retryable failure with attempts left; run again at `retry_at`
    RetryScheduled {
        failure: ActivityFailure,
        attempts: u32,
        retry_at: i64,
    },
    /// Non-retryable failure or attempts exhausted
    Failed { failure: ActivityFailure, attempts: u32 },
}

impl ActivityResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ActivityResult::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ActivityResult::Succeeded { attempts, .. }
            | ActivityResult::RetryScheduled { attempts, .. }
            | ActivityResult::Failed { attempts, .. } => *attempts,
        }
    }
}
