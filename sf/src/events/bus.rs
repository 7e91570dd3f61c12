//! Event Bus - pub/sub for workflow notifications
//!
//! Uses a tokio broadcast channel. Producers (signal bus, engine) emit after
//! their writes are durable; the runner and loggers subscribe.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::FlowEvent;
use crate::domain::{ActivityKind, Stage};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Central event bus for workflow activity
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped. Slow
    /// subscribers lag and lose the oldest events.
    pub fn emit(&self, event: FlowEvent) {
        debug!(
            event_type = event.event_type(),
            instance_id = event.instance_id(),
            "EventBus::emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Emitter bound to one instance
    pub fn emitter_for(&self, instance_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            instance_id: instance_id.into(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheap handle for emitting events about a single instance
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<FlowEvent>,
    instance_id: String,
}

impl EventEmitter {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Emit a raw event
    pub fn emit(&self, event: FlowEvent) {
        debug!(event_type = event.event_type(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn turn_dispatched(&self, turn_id: &str, stage: Stage, tasks: usize) {
        self.emit(FlowEvent::TurnDispatched {
            instance_id: self.instance_id.clone(),
            turn_id: turn_id.to_string(),
            stage,
            tasks,
        });
    }

    pub fn activity_finished(&self, task_id: &str, kind: ActivityKind, success: bool, attempts: u32) {
        self.emit(FlowEvent::ActivityFinished {
            instance_id: self.instance_id.clone(),
            task_id: task_id.to_string(),
            kind,
            success,
            attempts,
        });
    }

    pub fn stage_committed(&self, from: Stage, to: Stage, version: u64) {
        self.emit(FlowEvent::StageCommitted {
            instance_id: self.instance_id.clone(),
            from,
            to,
            version,
        });
    }

    pub fn suspended(&self, reason: &str) {
        self.emit(FlowEvent::Suspended {
            instance_id: self.instance_id.clone(),
            reason: reason.to_string(),
        });
    }

    pub fn escalated(&self, ticket_id: &str) {
        self.emit(FlowEvent::Escalated {
            instance_id: self.instance_id.clone(),
            ticket_id: ticket_id.to_string(),
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
