//! Workflow event bus
//!
//! Every durable change (instance started, signal accepted, stage committed,
//! escalation raised) is announced on a broadcast channel. The runner
//! listens for wake-ups; anything else may subscribe for observability.

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use types::FlowEvent;
