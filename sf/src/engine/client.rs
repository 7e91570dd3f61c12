//! WorkflowClient - the non-executing side of the engine
//!
//! Starting instances, delivering signals and reading state never run
//! activities, so the CLI and other front ends use this handle directly.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::EngineError;
use super::replay::WorkflowInstance;
use super::view::{InstanceHandle, WorkflowInstanceView, projection_record, snapshot_record};
use crate::clock::SharedClock;
use crate::domain::{EscalationTicket, HistoryEvent, Signal};
use crate::events::{EventBus, FlowEvent};
use crate::signals::{SignalBus, SignalOutcome};
use crate::state::StateManager;

/// One decoded history record
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub sequence_no: u64,
    pub generation: u32,
    pub version: u64,
    pub recorded_at: i64,
    pub event: HistoryEvent,
}

/// A stored escalation ticket and whether the sink has it
#[derive(Debug, Clone, PartialEq)]
pub struct TicketEntry {
    pub ticket: EscalationTicket,
    pub delivered_at: Option<i64>,
}

#[derive(Clone)]
pub struct WorkflowClient {
    state: StateManager,
    signals: SignalBus,
    events: Arc<EventBus>,
    clock: SharedClock,
}

impl WorkflowClient {
    pub fn new(state: StateManager, events: Arc<EventBus>, clock: SharedClock, queue_capacity: usize) -> Self {
        let signals = SignalBus::new(state.clone(), events.clone(), clock.clone(), queue_capacity);
        Self {
            state,
            signals,
            events,
            clock,
        }
    }

    pub fn signal_bus(&self) -> &SignalBus {
        &self.signals
    }

    /// Create an instance at version 0 in ONBOARDING
    ///
    /// Fails with `AlreadyExists` while an instance with this id is live. A
    /// terminal instance is kept for audit and a new generation begins.
    pub async fn start(&self, instance_id: &str, initial_context: Map<String, Value>) -> Result<InstanceHandle, EngineError> {
        debug!(%instance_id, "start: called");

        let generation = match self.state.load_snapshot(instance_id).await? {
            Some(existing) if !existing.terminal => {
                return Err(EngineError::AlreadyExists(instance_id.to_string()));
            }
            Some(existing) => existing.generation + 1,
            None => 1,
        };

        let started_at = self.clock.now_ms();
        let event = HistoryEvent::Started {
            generation,
            initial_context: initial_context.clone(),
            started_at,
        };
        let instance = WorkflowInstance::started(instance_id, generation, initial_context, started_at);

        self.state
            .create_instance(snapshot_record(&instance)?, vec![event.to_record(started_at)?])
            .await?;
        self.state.put_projection(projection_record(&instance)?).await?;

        info!(%instance_id, generation, "Instance started");
        self.events.emit(FlowEvent::InstanceStarted {
            instance_id: instance_id.to_string(),
            generation,
        });

        Ok(WorkflowInstanceView::of(&instance).handle())
    }

    /// Deliver a signal; a terminal instance ignores it with a warning
    pub async fn signal(&self, instance_id: &str, signal: Signal) -> Result<SignalOutcome, EngineError> {
        debug!(%instance_id, signal_id = %signal.signal_id, "signal: called");
        Ok(self.signals.publish(instance_id, signal).await?)
    }

    /// Latest published view; never waits for a running turn
    pub async fn query(&self, instance_id: &str) -> Result<WorkflowInstanceView, EngineError> {
        debug!(%instance_id, "query: called");
        if let Some(projection) = self.state.load_projection(instance_id).await? {
            return Ok(serde_json::from_value(projection.body)?);
        }
        let snapshot = self
            .state
            .load_snapshot(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(instance_id.to_string()))?;
        Ok(serde_json::from_value(snapshot.body)?)
    }

    /// Decoded history, optionally limited to one generation
    pub async fn history(&self, instance_id: &str, generation: Option<u32>) -> Result<Vec<HistoryEntry>, EngineError> {
        debug!(%instance_id, ?generation, "history: called");
        let records = self.state.read_history(instance_id, generation).await?;
        if records.is_empty() && self.state.load_snapshot(instance_id).await?.is_none() {
            return Err(EngineError::NotFound(instance_id.to_string()));
        }
        records
            .iter()
            .map(|record| -> Result<HistoryEntry, EngineError> {
                Ok(HistoryEntry {
                    sequence_no: record.sequence_no,
                    generation: record.generation,
                    version: record.version,
                    recorded_at: record.recorded_at,
                    event: HistoryEvent::from_record(record)?,
                })
            })
            .collect()
    }

    /// Stored escalation tickets
    pub async fn tickets(&self, instance_id: Option<&str>, undelivered_only: bool) -> Result<Vec<TicketEntry>, EngineError> {
        debug!(?instance_id, undelivered_only, "tickets: called");
        self.state
            .list_tickets(instance_id, undelivered_only)
            .await?
            .iter()
            .map(|record| -> Result<TicketEntry, EngineError> {
                Ok(TicketEntry {
                    ticket: EscalationTicket::from_record(record)?,
                    delivered_at: record.delivered_at,
                })
            })
            .collect()
    }
}
