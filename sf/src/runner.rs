//! WorkflowRunner - keeps every live instance moving
//!
//! The runner is responsible for:
//! - Recovering live instances and undelivered tickets on startup
//! - Waking instances when a signal arrives or an instance starts
//! - Re-running instances whose retry timers came due
//! - Enforcing the concurrency limit via semaphore
//! - Never running the same instance twice at once from this process

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RunnerConfig;
use crate::engine::{EngineError, RunOutcome, Suspension, WorkflowEngine};
use crate::events::FlowEvent;
use crate::state::scan_for_recovery;

/// How long shutdown waits for in-flight runs
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type Finished = (String, Result<RunOutcome, EngineError>);

pub struct WorkflowRunner {
    engine: WorkflowEngine,
    config: RunnerConfig,
    semaphore: Arc<Semaphore>,

    /// Instances with a run in progress
    in_flight: HashSet<String>,

    /// Instances woken while running; run again when the current run ends
    rerun: HashSet<String>,

    /// Retry timers: due time to instances
    timers: BTreeMap<i64, HashSet<String>>,

    done_tx: mpsc::Sender<Finished>,
    done_rx: mpsc::Receiver<Finished>,

    /// Runs finished since the runner started
    completed: usize,

    shutdown_requested: bool,
}

impl WorkflowRunner {
    pub fn new(engine: WorkflowEngine, config: RunnerConfig) -> Self {
        let (done_tx, done_rx) = mpsc::channel(256);
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_instances.max(1))),
            config,
            in_flight: HashSet::new(),
            rerun: HashSet::new(),
            timers: BTreeMap::new(),
            done_tx,
            done_rx,
            completed: 0,
            shutdown_requested: false,
        }
    }

    /// Run until a shutdown message arrives
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        debug!("run: called");
        info!(worker_id = %self.engine.worker_id(), "WorkflowRunner starting");

        // Subscribe before recovery so nothing published meanwhile is missed
        let mut events = self.engine.events().subscribe();
        self.recover().await?;

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        interval.tick().await;

        loop {
            let next_timer = self.next_timer_delay();
            tokio::select! {
                event = events.recv() => {
                    self.handle_event(event).await?;
                }

                Some((instance_id, result)) = self.done_rx.recv() => {
                    self.handle_finished(instance_id, result);
                }

                _ = tokio::time::sleep(next_timer.unwrap_or(Duration::MAX)), if next_timer.is_some() => {
                    self.fire_due_timers();
                }

                // Fallback for wake-ups lost between processes or to lag
                _ = interval.tick() => {
                    debug!("run: poll tick");
                    self.poll().await?;
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    self.shutdown_requested = true;
                    break;
                }
            }
        }

        self.shutdown().await;
        debug!("run: complete");
        Ok(())
    }

    /// Advance every live instance until nothing is runnable right now
    ///
    /// Retry timers are left pending. Returns the number of runs made.
    pub async fn run_until_idle(&mut self) -> Result<usize> {
        debug!("run_until_idle: called");
        let before = self.completed;
        self.recover().await?;
        self.drain_in_flight(None).await;
        Ok(self.completed - before)
    }

    /// Instances with a retry timer, and when the earliest is due
    pub fn pending_timers(&self) -> Option<(usize, i64)> {
        let count = self.timers.values().map(HashSet::len).sum();
        self.timers.keys().next().map(|due_at| (count, *due_at))
    }

    async fn recover(&mut self) -> Result<()> {
        debug!("recover: called");
        let stats = scan_for_recovery(self.engine.state())
            .await
            .context("Failed to scan for recovery")?;
        info!(%stats, "Recovery scan complete");

        match self.engine.escalation().redeliver_pending().await {
            Ok(0) => {}
            Ok(delivered) => info!(delivered, "Redelivered escalation tickets"),
            Err(e) => warn!(error = %e, "Ticket redelivery failed, will retry on next recovery"),
        }

        for instance_id in stats.instances {
            self.spawn_run(instance_id);
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<()> {
        if self.shutdown_requested {
            return Ok(());
        }
        let live = self
            .engine
            .state()
            .list_snapshots(false)
            .await
            .context("Failed to list live instances")?;
        debug!(count = live.len(), "poll: live instances");
        for snapshot in live {
            if !self.in_flight.contains(&snapshot.instance_id) {
                self.spawn_run(snapshot.instance_id);
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: Result<FlowEvent, RecvError>) -> Result<()> {
        match event {
            Ok(event) if event.wakes_instance() => {
                debug!(event_type = event.event_type(), instance_id = event.instance_id(), "handle_event: wake");
                self.spawn_run(event.instance_id().to_string());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                debug!(n, "handle_event: lagged behind, doing full poll");
                self.poll().await?;
            }
            Err(RecvError::Closed) => {
                warn!("handle_event: event bus closed, falling back to polling only");
            }
        }
        Ok(())
    }

    fn spawn_run(&mut self, instance_id: String) {
        if self.shutdown_requested {
            return;
        }
        if self.in_flight.contains(&instance_id) {
            debug!(%instance_id, "spawn_run: already running, marking for rerun");
            self.rerun.insert(instance_id);
            return;
        }
        self.in_flight.insert(instance_id.clone());

        let engine = self.engine.clone();
        let semaphore = self.semaphore.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => engine.run_to_next_suspension(&instance_id).await,
                Err(_) => return,
            };
            if done_tx.send((instance_id, result)).await.is_err() {
                debug!("spawn_run: runner gone, result dropped");
            }
        });
    }

    fn handle_finished(&mut self, instance_id: String, result: Result<RunOutcome, EngineError>) {
        self.in_flight.remove(&instance_id);
        self.completed += 1;

        match result {
            Ok(outcome) => {
                debug!(%instance_id, suspension = %outcome.suspension, steps = outcome.steps, "handle_finished: run ended");
                match outcome.suspension {
                    Suspension::Yielded => {
                        self.rerun.insert(instance_id.clone());
                    }
                    ref suspension => {
                        if let Some(due_at) = suspension.wake_at() {
                            self.timers.entry(due_at).or_default().insert(instance_id.clone());
                        }
                    }
                }
            }
            Err(e) => {
                error!(%instance_id, error = %e, "Run failed");
            }
        }

        if self.rerun.remove(&instance_id) {
            self.spawn_run(instance_id);
        }
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        let due_at = *self.timers.keys().next()?;
        let wait = (due_at - self.engine.clock().now_ms()).max(0);
        Some(Duration::from_millis(wait as u64))
    }

    fn fire_due_timers(&mut self) {
        let now = self.engine.clock().now_ms();
        let later = self.timers.split_off(&(now + 1));
        let due = std::mem::replace(&mut self.timers, later);
        for instance_id in due.into_values().flatten() {
            debug!(%instance_id, "fire_due_timers: timer due");
            self.spawn_run(instance_id);
        }
    }

    /// Wait for in-flight runs; `None` waits without limit
    async fn drain_in_flight(&mut self, timeout: Option<Duration>) {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        while !self.in_flight.is_empty() {
            let finished = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                    Ok(finished) => finished,
                    Err(_) => {
                        warn!(remaining = self.in_flight.len(), "Timed out waiting for in-flight runs");
                        return;
                    }
                },
                None => self.done_rx.recv().await,
            };
            match finished {
                Some((instance_id, result)) => self.handle_finished(instance_id, result),
                None => return,
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!(in_flight = self.in_flight.len(), "shutdown: called");
        self.drain_in_flight(Some(SHUTDOWN_TIMEOUT)).await;
        self.semaphore.close();
        info!(runs = self.completed, "WorkflowRunner stopped");
    }
}
