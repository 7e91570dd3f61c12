//! Signal bus - durable per-instance inbound queue
//!
//! Publishing persists the signal before announcing it, so a crash between
//! the two loses only the wake-up, which the runner's poll recovers. Signals
//! leave the queue only when the engine acknowledges them inside a commit.

use std::sync::Arc;

use sessionstore::EnqueueOutcome;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::domain::Signal;
use crate::events::{EventBus, FlowEvent};
use crate::state::{StateError, StateManager};

/// What happened to a published signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Durably enqueued; `dropped` names an older signal evicted to make room
    Accepted { dropped: Option<String> },
    /// Same signal id already received; nothing changed
    Duplicate,
    /// Queue full of signals that may not be dropped
    Rejected,
    /// Instance is in a terminal stage; the signal was discarded
    IgnoredTerminal,
}

impl SignalOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SignalOutcome::Accepted { .. })
    }
}

/// Accepts signals for instances and hands them to the engine in order
#[derive(Clone)]
pub struct SignalBus {
    state: StateManager,
    events: Arc<EventBus>,
    clock: SharedClock,
    capacity: usize,
}

impl SignalBus {
    pub fn new(state: StateManager, events: Arc<EventBus>, clock: SharedClock, capacity: usize) -> Self {
        Self {
            state,
            events,
            clock,
            capacity: capacity.max(1),
        }
    }

    /// Persist a signal for `instance_id`
    pub async fn publish(&self, instance_id: &str, mut signal: Signal) -> Result<SignalOutcome, StateError> {
        debug!(%instance_id, signal_id = %signal.signal_id, kind = %signal.kind, "publish: called");

        let snapshot = self.state.load_snapshot_required(instance_id).await?;
        if snapshot.terminal {
            warn!(
                %instance_id,
                stage = %snapshot.stage,
                signal_id = %signal.signal_id,
                "Signal for terminal instance ignored"
            );
            return Ok(SignalOutcome::IgnoredTerminal);
        }

        signal.received_at = self.clock.now_ms();
        let record = signal.to_new_record(instance_id)?;
        let outcome = match self.state.enqueue_signal(record, self.capacity).await? {
            EnqueueOutcome::Accepted { seq, dropped } => {
                if let Some(dropped_id) = &dropped {
                    warn!(%instance_id, %dropped_id, "Signal queue full, dropped oldest non-critical signal");
                }
                info!(%instance_id, signal_id = %signal.signal_id, seq, "Signal accepted");
                self.events.emit(FlowEvent::SignalAccepted {
                    instance_id: instance_id.to_string(),
                    signal_id: signal.signal_id.clone(),
                    kind: signal.kind,
                });
                SignalOutcome::Accepted { dropped }
            }
            EnqueueOutcome::Duplicate => {
                debug!(%instance_id, signal_id = %signal.signal_id, "Duplicate signal ignored");
                SignalOutcome::Duplicate
            }
            EnqueueOutcome::Rejected => {
                warn!(%instance_id, signal_id = %signal.signal_id, "Signal queue full, signal rejected");
                SignalOutcome::Rejected
            }
        };
        Ok(outcome)
    }

    /// Pending signals in delivery order: critical first, then arrival order
    ///
    /// Reading does not consume; the engine acks what it used in its commit.
    pub async fn drain(&self, instance_id: &str) -> Result<Vec<Signal>, StateError> {
        debug!(%instance_id, "drain: called");
        let records = self.state.pending_signals(instance_id).await?;
        let mut signals = Vec::with_capacity(records.len());
        for record in &records {
            match Signal::from_record(record) {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    warn!(%instance_id, signal_id = %record.signal_id, error = %e, "Dropping unreadable signal");
                    self.state.drop_signal(instance_id, &record.signal_id).await?;
                }
            }
        }
        Ok(signals)
    }
}
