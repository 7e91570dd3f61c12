//! Escalation manager
//!
//! Counts consecutive failed turns and decides when an instance is handed to
//! a human. The ticket is written in the same commit as the transition to
//! ESCALATED; delivery to the sink happens afterwards and is retried until
//! the sink accepts it.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::replay::WorkflowInstance;
use crate::clock::SharedClock;
use crate::collaborators::EscalationSink;
use crate::domain::{ActivityFailure, ErrorClass, EscalationTicket};
use crate::events::EventBus;
use crate::state::{StateError, StateManager};

/// What a failure means for the instance
#[derive(Debug, Clone, PartialEq)]
pub enum FailureVerdict {
    /// Counted; the instance keeps trying
    Retry { consecutive_failures: u32 },
    /// Hand off to a human with this ticket
    Escalate(EscalationTicket),
}

#[derive(Clone)]
pub struct EscalationManager {
    state: StateManager,
    sink: Arc<dyn EscalationSink>,
    events: Arc<EventBus>,
    clock: SharedClock,
    threshold: u32,
}

impl EscalationManager {
    pub fn new(
        state: StateManager,
        sink: Arc<dyn EscalationSink>,
        events: Arc<EventBus>,
        clock: SharedClock,
        threshold: u32,
    ) -> Self {
        Self {
            state,
            sink,
            events,
            clock,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a failed turn; fatal failures escalate regardless of the count
    pub fn record_failure(&self, instance: &WorkflowInstance, failure: &ActivityFailure) -> FailureVerdict {
        let consecutive_failures = instance.consecutive_failures + 1;
        debug!(
            instance_id = %instance.instance_id,
            consecutive_failures,
            class = %failure.class,
            "record_failure: called"
        );
        if failure.class == ErrorClass::Fatal || consecutive_failures >= self.threshold {
            let reason = format!("{} after {} consecutive failures", failure, consecutive_failures);
            return FailureVerdict::Escalate(self.ticket(instance, &reason, consecutive_failures));
        }
        FailureVerdict::Retry { consecutive_failures }
    }

    /// Failure count after a successful turn
    pub fn record_success(&self, instance: &WorkflowInstance) -> u32 {
        if instance.consecutive_failures > 0 {
            debug!(instance_id = %instance.instance_id, "record_success: resetting failure count");
        }
        0
    }

    /// Ticket for the commit that moves `instance` to ESCALATED
    pub fn ticket(&self, instance: &WorkflowInstance, reason: &str, consecutive_failures: u32) -> EscalationTicket {
        let version = instance.version + 1;
        EscalationTicket {
            ticket_id: EscalationTicket::id_for(&instance.instance_id, instance.generation, version),
            instance_id: instance.instance_id.clone(),
            generation: instance.generation,
            version,
            stage: instance.resume_stage.unwrap_or(instance.stage),
            reason: reason.to_string(),
            consecutive_failures,
            context_snapshot: instance.session_state.public_view(),
            created_at: self.clock.now_ms(),
        }
    }

    /// Hand a committed ticket to the sink and mark it delivered
    ///
    /// Returns the sink reference, or `None` when the sink is unavailable and
    /// the ticket stays queued for redelivery.
    pub async fn deliver(&self, ticket: &EscalationTicket) -> Result<Option<String>, StateError> {
        debug!(ticket_id = %ticket.ticket_id, "deliver: called");
        match self.sink.create_ticket(ticket).await {
            Ok(reference) => {
                self.state
                    .mark_ticket_delivered(&ticket.ticket_id, self.clock.now_ms())
                    .await?;
                info!(ticket_id = %ticket.ticket_id, %reference, "Escalation ticket delivered");
                self.events
                    .emitter_for(ticket.instance_id.as_str())
                    .escalated(&ticket.ticket_id);
                Ok(Some(reference))
            }
            Err(e) => {
                warn!(ticket_id = %ticket.ticket_id, error = %e, "Escalation sink unavailable, ticket kept for redelivery");
                Ok(None)
            }
        }
    }

    /// Retry delivery of every committed but undelivered ticket
    pub async fn redeliver_pending(&self) -> Result<usize, StateError> {
        debug!("redeliver_pending: called");
        let mut delivered = 0;
        for record in self.state.list_tickets(None, true).await? {
            let ticket = EscalationTicket::from_record(&record)?;
            if self.deliver(&ticket).await?.is_some() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
