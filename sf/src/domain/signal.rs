//! Inbound signals

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sessionstore::{NewSignal, SignalRecord};

/// What kind of external event a signal carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    UserMessage,
    ToolCallback,
    TimerFired,
    Cancel,
    Escalate,
}

impl SignalKind {
    /// Critical signals drain first and are never dropped on overflow
    pub fn is_critical(&self) -> bool {
        matches!(self, SignalKind::Cancel | SignalKind::Escalate)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::UserMessage => "user_message",
            SignalKind::ToolCallback => "tool_callback",
            SignalKind::TimerFired => "timer_fired",
            SignalKind::Cancel => "cancel",
            SignalKind::Escalate => "escalate",
        };
        write!(f, "{name}")
    }
}

/// An external event delivered to one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Sender-supplied id used for deduplication
    pub signal_id: String,
    pub kind: SignalKind,
    /// Domain the message is about; `None` means the current stage
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Set by the signal bus when the signal is persisted
    #[serde(default)]
    pub received_at: i64,
}

impl Signal {
    pub fn new(signal_id: impl Into<String>, kind: SignalKind, payload: Value) -> Self {
        Self {
            signal_id: signal_id.into(),
            kind,
            intent: None,
            payload,
            received_at: 0,
        }
    }

    pub fn user_message(signal_id: impl Into<String>, payload: Value) -> Self {
        Self::new(signal_id, SignalKind::UserMessage, payload)
    }

    pub fn cancel(signal_id: impl Into<String>) -> Self {
        Self::new(signal_id, SignalKind::Cancel, Value::Null)
    }

    pub fn escalate(signal_id: impl Into<String>, reason: &str) -> Self {
        Self::new(signal_id, SignalKind::Escalate, serde_json::json!({ "reason": reason }))
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }

    /// Queue record for this signal
    pub fn to_new_record(&self, instance_id: &str) -> Result<NewSignal, serde_json::Error> {
        Ok(NewSignal {
            instance_id: instance_id.to_string(),
            signal_id: self.signal_id.clone(),
            critical: self.is_critical(),
            payload: serde_json::to_value(self)?,
            received_at: self.received_at,
        })
    }

    pub fn from_record(record: &SignalRecord) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record.payload.clone())
    }
}
