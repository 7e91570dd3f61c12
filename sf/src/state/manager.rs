//! StateManager - actor that owns the session store
//!
//! Processes commands via channels for thread-safe access to persistent state.
//! Commands are applied one at a time, so every store transaction is
//! serialized behind the actor.

use sessionstore::{
    CommitReceipt, CommitRequest, EnqueueOutcome, HistoryRecord, Lease, NewHistoryRecord, NewSignal, ProjectionRecord,
    SignalRecord, SnapshotRecord, Store, TicketRecord,
};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a StateManager over the database at `store_path`
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let store = Store::open(store_path.as_ref())?;
        Ok(Self::with_store(store))
    }

    /// Spawn a StateManager over a private in-memory database
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        debug!("spawn_in_memory: called");
        Ok(Self::with_store(Store::open_in_memory()?))
    }

    fn with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Instances ===

    /// Create an instance or a new generation of a terminal one
    pub async fn create_instance(
        &self,
        snapshot: SnapshotRecord,
        history: Vec<NewHistoryRecord>,
    ) -> StateResponse<CommitReceipt> {
        debug!(instance_id = %snapshot.instance_id, generation = snapshot.generation, "create_instance: called");
        self.request(|reply| StateCommand::CreateInstance {
            snapshot,
            history,
            reply,
        })
        .await
    }

    pub async fn load_snapshot(&self, instance_id: &str) -> StateResponse<Option<SnapshotRecord>> {
        debug!(%instance_id, "load_snapshot: called");
        self.request(|reply| StateCommand::LoadSnapshot {
            instance_id: instance_id.to_string(),
            reply,
        })
        .await
    }

    /// Load a snapshot, returning error if not found
    pub async fn load_snapshot_required(&self, instance_id: &str) -> StateResponse<SnapshotRecord> {
        self.load_snapshot(instance_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("instance {instance_id}")))
    }

    pub async fn list_snapshots(&self, include_terminal: bool) -> StateResponse<Vec<SnapshotRecord>> {
        debug!(include_terminal, "list_snapshots: called");
        self.request(|reply| StateCommand::ListSnapshots { include_terminal, reply })
            .await
    }

    // === History ===

    pub async fn read_history(&self, instance_id: &str, generation: Option<u32>) -> StateResponse<Vec<HistoryRecord>> {
        debug!(%instance_id, ?generation, "read_history: called");
        self.request(|reply| StateCommand::ReadHistory {
            instance_id: instance_id.to_string(),
            generation,
            reply,
        })
        .await
    }

    pub async fn find_task_completion(&self, task_id: &str) -> StateResponse<Option<HistoryRecord>> {
        debug!(%task_id, "find_task_completion: called");
        self.request(|reply| StateCommand::FindTaskCompletion {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    // === Leases and commits ===

    pub async fn acquire_lease(
        &self,
        instance_id: &str,
        owner: &str,
        token: &str,
        now: i64,
        ttl_ms: i64,
    ) -> StateResponse<Lease> {
        debug!(%instance_id, %owner, "acquire_lease: called");
        self.request(|reply| StateCommand::AcquireLease {
            instance_id: instance_id.to_string(),
            owner: owner.to_string(),
            token: token.to_string(),
            now,
            ttl_ms,
            reply,
        })
        .await
    }

    /// Extend a lease held under its token; returns the new expiry
    pub async fn renew_lease(&self, lease: &Lease, now: i64, ttl_ms: i64) -> StateResponse<i64> {
        debug!(instance_id = %lease.instance_id, "renew_lease: called");
        self.request(|reply| StateCommand::RenewLease {
            lease: lease.clone(),
            now,
            ttl_ms,
            reply,
        })
        .await
    }

    pub async fn release_lease(&self, lease: Lease) -> StateResponse<bool> {
        debug!(instance_id = %lease.instance_id, "release_lease: called");
        self.request(|reply| StateCommand::ReleaseLease { lease, reply }).await
    }

    /// Atomically apply one engine step
    pub async fn commit(&self, request: CommitRequest) -> StateResponse<CommitReceipt> {
        debug!(
            instance_id = %request.instance_id,
            expected_version = request.expected_version,
            "commit: called"
        );
        self.request(|reply| StateCommand::Commit { request, reply }).await
    }

    // === Signals ===

    pub async fn enqueue_signal(&self, signal: NewSignal, capacity: usize) -> StateResponse<EnqueueOutcome> {
        debug!(instance_id = %signal.instance_id, signal_id = %signal.signal_id, "enqueue_signal: called");
        self.request(|reply| StateCommand::EnqueueSignal {
            signal,
            capacity,
            reply,
        })
        .await
    }

    pub async fn pending_signals(&self, instance_id: &str) -> StateResponse<Vec<SignalRecord>> {
        debug!(%instance_id, "pending_signals: called");
        self.request(|reply| StateCommand::PendingSignals {
            instance_id: instance_id.to_string(),
            reply,
        })
        .await
    }

    /// Move an unusable pending signal out of the queue
    pub async fn drop_signal(&self, instance_id: &str, signal_id: &str) -> StateResponse<bool> {
        debug!(%instance_id, %signal_id, "drop_signal: called");
        self.request(|reply| StateCommand::DropSignal {
            instance_id: instance_id.to_string(),
            signal_id: signal_id.to_string(),
            reply,
        })
        .await
    }

    // === Tickets ===

    pub async fn list_tickets(&self, instance_id: Option<&str>, undelivered_only: bool) -> StateResponse<Vec<TicketRecord>> {
        debug!(?instance_id, undelivered_only, "list_tickets: called");
        self.request(|reply| StateCommand::ListTickets {
            instance_id: instance_id.map(String::from),
            undelivered_only,
            reply,
        })
        .await
    }

    pub async fn mark_ticket_delivered(&self, ticket_id: &str, now: i64) -> StateResponse<()> {
        debug!(%ticket_id, "mark_ticket_delivered: called");
        self.request(|reply| StateCommand::MarkTicketDelivered {
            ticket_id: ticket_id.to_string(),
            now,
            reply,
        })
        .await
    }

    // === Projections ===

    pub async fn put_projection(&self, projection: ProjectionRecord) -> StateResponse<bool> {
        debug!(instance_id = %projection.instance_id, version = projection.version, "put_projection: called");
        self.request(|reply| StateCommand::PutProjection { projection, reply })
            .await
    }

    pub async fn load_projection(&self, instance_id: &str) -> StateResponse<Option<ProjectionRecord>> {
        debug!(%instance_id, "load_projection: called");
        self.request(|reply| StateCommand::LoadProjection {
            instance_id: instance_id.to_string(),
            reply,
        })
        .await
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// Actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("actor_loop: called");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateInstance {
                snapshot,
                history,
                reply,
            } => {
                debug!(instance_id = %snapshot.instance_id, "actor_loop: CreateInstance command");
                let _ = reply.send(store.create_instance(snapshot, history).map_err(StateError::from));
            }

            StateCommand::LoadSnapshot { instance_id, reply } => {
                let _ = reply.send(store.load_snapshot(&instance_id).map_err(StateError::from));
            }

            StateCommand::ListSnapshots { include_terminal, reply } => {
                let _ = reply.send(store.list_snapshots(include_terminal).map_err(StateError::from));
            }

            StateCommand::ReadHistory {
                instance_id,
                generation,
                reply,
            } => {
                let _ = reply.send(store.read_history(&instance_id, generation).map_err(StateError::from));
            }

            StateCommand::FindTaskCompletion { task_id, reply } => {
                let _ = reply.send(store.find_task_completion(&task_id).map_err(StateError::from));
            }

            StateCommand::AcquireLease {
                instance_id,
                owner,
                token,
                now,
                ttl_ms,
                reply,
            } => {
                debug!(%instance_id, %owner, "actor_loop: AcquireLease command");
                let result = store
                    .acquire_lease(&instance_id, &owner, &token, now, ttl_ms)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::RenewLease {
                lease,
                now,
                ttl_ms,
                reply,
            } => {
                let _ = reply.send(store.renew_lease(&lease, now, ttl_ms).map_err(StateError::from));
            }

            StateCommand::ReleaseLease { lease, reply } => {
                let _ = reply.send(store.release_lease(&lease).map_err(StateError::from));
            }

            StateCommand::Commit { request, reply } => {
                debug!(instance_id = %request.instance_id, "actor_loop: Commit command");
                let _ = reply.send(store.commit(request).map_err(StateError::from));
            }

            StateCommand::EnqueueSignal {
                signal,
                capacity,
                reply,
            } => {
                debug!(signal_id = %signal.signal_id, "actor_loop: EnqueueSignal command");
                let _ = reply.send(store.enqueue_signal(signal, capacity).map_err(StateError::from));
            }

            StateCommand::PendingSignals { instance_id, reply } => {
                let _ = reply.send(store.pending_signals(&instance_id).map_err(StateError::from));
            }

            StateCommand::DropSignal {
                instance_id,
                signal_id,
                reply,
            } => {
                let _ = reply.send(store.drop_signal(&instance_id, &signal_id).map_err(StateError::from));
            }

            StateCommand::ListTickets {
                instance_id,
                undelivered_only,
                reply,
            } => {
                let result = store
                    .list_tickets(instance_id.as_deref(), undelivered_only)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::MarkTicketDelivered { ticket_id, now, reply } => {
                let _ = reply.send(store.mark_ticket_delivered(&ticket_id, now).map_err(StateError::from));
            }

            StateCommand::PutProjection { projection, reply } => {
                let _ = reply.send(store.put_projection(&projection).map_err(StateError::from));
            }

            StateCommand::LoadProjection { instance_id, reply } => {
                let _ = reply.send(store.load_projection(&instance_id).map_err(StateError::from));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
