//! WorkflowEngine - advances one instance until it has to wait
//!
//! A run takes the instance lease, replays history, then loops: drain
//! signals, ask the router what to do, run activities, commit. Every commit
//! is a compare-and-swap on the instance version under the lease, so two
//! workers can never both commit from the same version. The run ends at the
//! first suspension point (waiting on a signal, a retry timer, or a terminal
//! stage) and releases the lease.

use serde_json::{Map, Value, json};
use sessionstore::{CommitReceipt, CommitRequest, Lease, SnapshotRecord, TicketRecord};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use super::client::WorkflowClient;
use super::error::EngineError;
use super::escalation::{EscalationManager, FailureVerdict};
use super::replay::{OpenTurn, WorkflowInstance, replay};
use super::view::{InstanceHandle, WorkflowInstanceView, projection_record, snapshot_record};
use crate::clock::SharedClock;
use crate::collaborators::Collaborators;
use crate::config::{Config, EngineConfig};
use crate::domain::{
    ActivityFailure, ActivityKind, ActivityOutput, ActivityResult, ActivityTask, ErrorClass, EscalationTicket,
    FieldWrite, HistoryEvent, NextHint, OutputTarget, Signal, Stage, TransitionRecord, TurnKind, TurnPlan,
    exit_key, is_reserved_key, lease_token, task_id, turn_id, worker_id,
};
use crate::events::{EventBus, FlowEvent};
use crate::executor::ActivityExecutor;
use crate::router::{RouteDecision, RouteInput, RouterRules, TurnSpec, route};
use crate::signals::SignalOutcome;
use crate::state::{StateError, StateManager};

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// COMPLETED, FAILED or ESCALATED; nothing more will happen
    Terminal { stage: Stage },
    /// Needs input; `clarification` is the question put to the user, if any
    AwaitingSignal {
        missing: Vec<String>,
        clarification: Option<String>,
    },
    /// Work is scheduled; run again at `due_at`
    RetryScheduled { due_at: i64 },
    /// Another worker is running this instance
    LeaseHeld { owner: String, expires_at: i64 },
    /// Step limit reached with work left; run again immediately
    Yielded,
}

impl Suspension {
    /// When the runner should try this instance again on its own
    pub fn wake_at(&self) -> Option<i64> {
        match self {
            Suspension::RetryScheduled { due_at } => Some(*due_at),
            Suspension::LeaseHeld { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }
}

impl std::fmt::Display for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suspension::Terminal { stage } => write!(f, "terminal in {stage}"),
            Suspension::AwaitingSignal { missing, .. } if missing.is_empty() => write!(f, "awaiting signal"),
            Suspension::AwaitingSignal { missing, .. } => write!(f, "awaiting signal (missing: {})", missing.join(", ")),
            Suspension::RetryScheduled { due_at } => write!(f, "retry due at {due_at}"),
            Suspension::LeaseHeld { owner, .. } => write!(f, "lease held by {owner}"),
            Suspension::Yielded => write!(f, "yielded at step limit"),
        }
    }
}

/// Result of one `run_to_next_suspension`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub handle: InstanceHandle,
    pub suspension: Suspension,
    /// Engine steps taken by this run
    pub steps: u32,
}

enum Step {
    Continue,
    Suspend(Suspension),
}

/// Everything a transition commit changes besides the stage
struct TransitionPlan {
    to: Stage,
    writes: Vec<FieldWrite>,
    acks: Vec<String>,
    consecutive_failures: u32,
    resume_stage: Option<Stage>,
    retry_not_before: Option<i64>,
    note: Option<String>,
    ticket: Option<EscalationTicket>,
}

impl TransitionPlan {
    fn to(to: Stage, instance: &WorkflowInstance) -> Self {
        Self {
            to,
            writes: Vec::new(),
            acks: Vec::new(),
            consecutive_failures: instance.consecutive_failures,
            resume_stage: None,
            retry_not_before: None,
            note: None,
            ticket: None,
        }
    }

    fn acking(mut self, signal_id: Option<String>) -> Self {
        self.acks.extend(signal_id);
        self
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    state: StateManager,
    client: WorkflowClient,
    executor: ActivityExecutor,
    escalation: EscalationManager,
    events: Arc<EventBus>,
    clock: SharedClock,
    config: EngineConfig,
    rules: Arc<RouterRules>,
    worker_id: String,
}

impl WorkflowEngine {
    pub fn new(
        config: &Config,
        state: StateManager,
        collaborators: Collaborators,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        let client = WorkflowClient::new(state.clone(), events.clone(), clock.clone(), config.signals.queue_capacity);
        let escalation = EscalationManager::new(
            state.clone(),
            collaborators.escalation.clone(),
            events.clone(),
            clock.clone(),
            config.engine.escalation_threshold,
        );
        let executor = ActivityExecutor::new(collaborators, state.clone(), clock.clone(), config.retry.clone());
        let worker_id = config.runner.worker_id.clone().unwrap_or_else(worker_id);
        Self {
            state,
            client,
            executor,
            escalation,
            events,
            clock,
            config: config.engine.clone(),
            rules: Arc::new(config.router.clone()),
            worker_id,
        }
    }

    pub fn client(&self) -> &WorkflowClient {
        &self.client
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn escalation(&self) -> &EscalationManager {
        &self.escalation
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn start(&self, instance_id: &str, initial_context: Map<String, Value>) -> Result<InstanceHandle, EngineError> {
        self.client.start(instance_id, initial_context).await
    }

    pub async fn signal(&self, instance_id: &str, signal: Signal) -> Result<SignalOutcome, EngineError> {
        self.client.signal(instance_id, signal).await
    }

    pub async fn query(&self, instance_id: &str) -> Result<WorkflowInstanceView, EngineError> {
        self.client.query(instance_id).await
    }

    /// Drive `instance_id` forward until it suspends
    ///
    /// Returns `LeaseHeld` without doing anything when another worker owns
    /// the instance. Faults (malformed tasks, broken invariants) move the
    /// instance to FAILED before the error is returned.
    pub async fn run_to_next_suspension(&self, instance_id: &str) -> Result<RunOutcome, EngineError> {
        debug!(%instance_id, worker_id = %self.worker_id, "run_to_next_suspension: called");

        let token = lease_token();
        let lease = match self
            .state
            .acquire_lease(instance_id, &self.worker_id, &token, self.clock.now_ms(), self.config.lease_ttl_ms)
            .await
        {
            Ok(lease) => lease,
            Err(StateError::LeaseHeld { owner, expires_at, .. }) => {
                debug!(%instance_id, %owner, expires_at, "run_to_next_suspension: lease held elsewhere");
                let view = self.client.query(instance_id).await?;
                return Ok(RunOutcome {
                    handle: view.handle(),
                    suspension: Suspension::LeaseHeld { owner, expires_at },
                    steps: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let driven = self.drive(&lease).await;
        if let Err(e) = self.state.release_lease(lease).await {
            warn!(%instance_id, error = %e, "Failed to release lease");
        }
        let (suspension, steps) = driven?;

        let instance = self.load(instance_id).await?;
        self.publish(&instance).await;

        if !matches!(suspension, Suspension::Terminal { .. }) {
            self.events.emitter_for(instance_id).suspended(&suspension.to_string());
        }
        info!(%instance_id, stage = %instance.stage, version = instance.version, steps, %suspension, "Run suspended");

        Ok(RunOutcome {
            handle: WorkflowInstanceView::of(&instance).handle(),
            suspension,
            steps,
        })
    }

    async fn drive(&self, lease: &Lease) -> Result<(Suspension, u32), EngineError> {
        let instance_id = lease.instance_id.as_str();
        let mut steps = 0u32;
        let mut conflicts = 0u32;

        loop {
            let instance = self.load(instance_id).await?;
            if instance.stage.is_terminal() {
                return Ok((Suspension::Terminal { stage: instance.stage }, steps));
            }
            if steps >= self.config.max_steps_per_run {
                info!(%instance_id, steps, "Step limit reached, yielding");
                return Ok((Suspension::Yielded, steps));
            }
            steps += 1;

            match self.step(lease, &instance).await {
                Ok(Step::Continue) => {}
                Ok(Step::Suspend(suspension)) => return Ok((suspension, steps)),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    warn!(%instance_id, conflicts, error = %e, "Commit conflict, replaying");
                    if conflicts > self.config.conflict_retry_limit {
                        let fresh = self.load(instance_id).await?;
                        if fresh.stage.is_terminal() {
                            continue;
                        }
                        let reason = format!("persistent commit conflict: {e}");
                        let ticket = self.escalation.ticket(&fresh, &reason, fresh.consecutive_failures);
                        self.escalate(lease, &fresh, ticket, None).await?;
                    }
                }
                Err(EngineError::Router(e)) => {
                    error!(%instance_id, error = %e, "No route for instance");
                    let ticket = self.escalation.ticket(&instance, &e.to_string(), instance.consecutive_failures);
                    self.escalate(lease, &instance, ticket, None).await?;
                }
                Err(e) if e.is_fault() => {
                    error!(%instance_id, error = %e, "Engine fault, failing instance");
                    let fresh = self.load(instance_id).await?;
                    if !fresh.stage.is_terminal() {
                        let plan = TransitionPlan::to(Stage::Failed, &fresh).with_note(format!("engine fault: {e}"));
                        if let Err(fail_err) = self.transition(lease, &fresh, plan).await {
                            error!(%instance_id, error = %fail_err, "Could not record fault");
                        }
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Rebuild the live generation from history
    async fn load(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        let snapshot = self.state.load_snapshot_required(instance_id).await?;
        let records = self.state.read_history(instance_id, Some(snapshot.generation)).await?;
        Ok(replay(instance_id, &records)?)
    }

    async fn step(&self, lease: &Lease, instance: &WorkflowInstance) -> Result<Step, EngineError> {
        let signals = self.client.signal_bus().drain(&instance.instance_id).await?;
        let head = signals.first();

        if let Some(signal) = head.filter(|signal| signal.is_critical()) {
            let decision = route(self.route_input(instance, Some(signal)))?;
            return self.apply_decision(lease, instance, decision).await;
        }

        if let Some(open) = &instance.open_turn {
            return self.advance_turn(lease, instance, open).await;
        }

        if let Some(not_before) = instance.retry_not_before {
            if self.clock.now_ms() < not_before {
                return Ok(Step::Suspend(Suspension::RetryScheduled { due_at: not_before }));
            }
        }

        let decision = route(self.route_input(instance, head))?;
        self.apply_decision(lease, instance, decision).await
    }

    fn route_input<'a>(&'a self, instance: &'a WorkflowInstance, signal: Option<&'a Signal>) -> RouteInput<'a> {
        RouteInput {
            instance_id: &instance.instance_id,
            stage: instance.stage,
            state: &instance.session_state,
            signal,
            resume_stage: instance.resume_stage,
            initial_context: &instance.initial_context,
            rules: &self.rules,
        }
    }

    async fn apply_decision(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        decision: RouteDecision,
    ) -> Result<Step, EngineError> {
        let instance_id = instance.instance_id.as_str();
        match decision {
            RouteDecision::Dispatch(spec) => {
                let plan = self.materialize(instance, spec);
                debug!(%instance_id, turn_id = %plan.turn_id, tasks = plan.tasks.len(), "apply_decision: dispatching turn");
                let (turn_id, stage, tasks) = (plan.turn_id.clone(), plan.stage, plan.tasks.len());
                self.commit(lease, instance, vec![HistoryEvent::TurnDispatched { turn: plan }], None, vec![], vec![])
                    .await?;
                self.events.emitter_for(instance_id).turn_dispatched(&turn_id, stage, tasks);
                Ok(Step::Continue)
            }
            RouteDecision::Advance { to } => {
                self.transition(lease, instance, TransitionPlan::to(to, instance)).await?;
                Ok(Step::Continue)
            }
            RouteDecision::Interrupt { target, signal_id } => {
                info!(%instance_id, from = %instance.stage, %target, %signal_id, "Off-stage signal, interrupting");
                let mut plan = TransitionPlan::to(Stage::IdleInterrupt, instance);
                plan.resume_stage = Some(instance.stage);
                self.transition(lease, instance, plan).await?;
                Ok(Step::Continue)
            }
            RouteDecision::Await { missing } => Ok(Step::Suspend(Suspension::AwaitingSignal {
                missing,
                clarification: instance.last_note.clone(),
            })),
            RouteDecision::Acknowledge { signal_id } => {
                debug!(%instance_id, %signal_id, "apply_decision: acknowledging signal");
                self.commit(lease, instance, vec![], None, vec![signal_id], vec![]).await?;
                Ok(Step::Continue)
            }
            RouteDecision::Cancel { signal_id } => {
                info!(%instance_id, %signal_id, "Session cancelled");
                let plan = TransitionPlan::to(Stage::Failed, instance)
                    .acking(Some(signal_id))
                    .with_note("cancelled by user");
                self.transition(lease, instance, plan).await?;
                Ok(Step::Continue)
            }
            RouteDecision::Escalate { signal_id, reason } => {
                let ticket = self.escalation.ticket(instance, &reason, instance.consecutive_failures);
                self.escalate(lease, instance, ticket, Some(signal_id)).await?;
                Ok(Step::Continue)
            }
        }
    }

    /// Assign ids and retry budgets to a routed turn
    fn materialize(&self, instance: &WorkflowInstance, spec: TurnSpec) -> TurnPlan {
        let turn_id = turn_id(&instance.instance_id, instance.generation, instance.version);
        let retry = self.executor.retry_config();
        let is_exit = matches!(spec.kind, TurnKind::StageExit { .. });
        let stage = spec.stage;
        let tasks = spec
            .tasks
            .into_iter()
            .enumerate()
            .map(|(branch, task)| {
                let policy = retry.policy_for(task.input.kind());
                let activity = ActivityTask::new(
                    task_id(&turn_id, branch),
                    task.input,
                    policy.max_attempts.max(1),
                    policy.timeout_ms,
                )
                .with_target(task.target);
                let activity = if is_exit {
                    activity.with_idempotency_key(exit_key(
                        &instance.instance_id,
                        instance.generation,
                        stage.as_str(),
                        branch,
                    ))
                } else {
                    activity
                };
                if task.required { activity } else { activity.optional() }
            })
            .collect();
        TurnPlan {
            turn_id,
            kind: spec.kind,
            stage: spec.stage,
            signal_id: spec.signal_id,
            tasks,
            writes: spec.writes,
            dispatched_at: self.clock.now_ms(),
        }
    }

    /// Run the due branches of the open turn, or settle it at the barrier
    async fn advance_turn(&self, lease: &Lease, instance: &WorkflowInstance, open: &OpenTurn) -> Result<Step, EngineError> {
        if open.is_settled() {
            return self.settle_turn(lease, instance, open).await;
        }

        let now = self.clock.now_ms();
        let due: Vec<ActivityTask> = open
            .pending_tasks()
            .into_iter()
            .filter(|task| open.retry_at.get(&task.task_id).is_none_or(|at| *at <= now))
            .collect();
        if due.is_empty() {
            let due_at = open.next_due().unwrap_or(now);
            debug!(instance_id = %instance.instance_id, due_at, "advance_turn: branches waiting on retry");
            return Ok(Step::Suspend(Suspension::RetryScheduled { due_at }));
        }

        let view = instance.session_state.public_view();
        let Some(results) = self.execute_interruptible(lease, &due, &view).await? else {
            info!(instance_id = %instance.instance_id, "Critical signal arrived, abandoning in-flight activities");
            return Ok(Step::Continue);
        };

        let emitter = self.events.emitter_for(instance.instance_id.as_str());
        let mut events = Vec::new();
        for (task, result) in due.iter().zip(results) {
            emitter.activity_finished(&task.task_id, task.kind(), result.is_success(), result.attempts());
            match result {
                ActivityResult::Succeeded { replayed: true, .. } => {
                    debug!(task_id = %task.task_id, "advance_turn: result already recorded");
                }
                ActivityResult::Succeeded { output, attempts, .. } => events.push(HistoryEvent::ActivityCompleted {
                    task_id: task.task_id.clone(),
                    attempt: attempts,
                    input_digest: task.input_digest.clone(),
                    output,
                }),
                ActivityResult::RetryScheduled {
                    failure,
                    attempts,
                    retry_at,
                } => events.push(HistoryEvent::ActivityFailed {
                    task_id: task.task_id.clone(),
                    attempt: attempts,
                    failure,
                    retry_at: Some(retry_at),
                }),
                ActivityResult::Failed { failure, attempts } => events.push(HistoryEvent::ActivityFailed {
                    task_id: task.task_id.clone(),
                    attempt: attempts,
                    failure,
                    retry_at: None,
                }),
            }
        }

        if events.is_empty() {
            return Err(EngineError::Invariant {
                instance_id: instance.instance_id.clone(),
                message: format!("turn {} made no progress", open.plan.turn_id),
            });
        }
        self.commit(lease, instance, events, None, vec![], vec![]).await?;
        Ok(Step::Continue)
    }

    /// Execute branches; reads and agent calls give way to a critical signal
    ///
    /// Returns `None` when a cancel or escalate arrived first. Writes and
    /// notifications always run to completion. The lease is renewed while
    /// the branches are in flight.
    async fn execute_interruptible(
        &self,
        lease: &Lease,
        tasks: &[ActivityTask],
        view: &Map<String, Value>,
    ) -> Result<Option<Vec<ActivityResult>>, EngineError> {
        let instance_id = lease.instance_id.as_str();
        let interruptible = tasks
            .iter()
            .all(|task| !matches!(task.kind(), ActivityKind::DataWrite | ActivityKind::Notify));
        let work = async {
            tokio::select! {
                results = self.executor.execute_all(tasks, view, self.config.fanout_concurrency) => results,
                never = self.keep_lease(lease) => match never {},
            }
        };
        if !interruptible {
            return Ok(Some(work.await?));
        }

        let mut events = self.events.subscribe();
        tokio::select! {
            results = work => Ok(Some(results?)),
            _ = critical_signal(&mut events, instance_id) => Ok(None),
        }
    }

    /// Renew `lease` every third of its ttl; never completes
    ///
    /// A failed renewal stops renewing. The next commit then fails on the
    /// lease and the run gives way to the new owner.
    async fn keep_lease(&self, lease: &Lease) -> Infallible {
        let ttl_ms = self.config.lease_ttl_ms.max(3);
        let period = Duration::from_millis((ttl_ms / 3) as u64);
        loop {
            tokio::time::sleep(period).await;
            match self.state.renew_lease(lease, self.clock.now_ms(), ttl_ms).await {
                Ok(expires_at) => debug!(instance_id = %lease.instance_id, expires_at, "keep_lease: renewed"),
                Err(e) => {
                    warn!(instance_id = %lease.instance_id, error = %e, "Lease renewal failed");
                    return std::future::pending().await;
                }
            }
        }
    }

    /// Decide how a turn ends once its fan-in barrier is reached
    async fn settle_turn(&self, lease: &Lease, instance: &WorkflowInstance, open: &OpenTurn) -> Result<Step, EngineError> {
        let abandoned = open.abandoned();

        let fatal = abandoned.iter().find(|(_, failure)| failure.class == ErrorClass::Fatal);
        let blocking = abandoned
            .iter()
            .find(|(task, failure)| task.required && failure.class != ErrorClass::Validation);
        if let Some((task, failure)) = fatal.or(blocking) {
            warn!(instance_id = %instance.instance_id, task_id = %task.task_id, %failure, "Turn failed");
            return self.fail_turn(lease, instance, open, failure).await;
        }

        if let Some((task, failure)) = abandoned.iter().find(|(task, _)| task.required) {
            info!(instance_id = %instance.instance_id, task_id = %task.task_id, %failure, "Output rejected, asking for clarification");
            return self.clarify(lease, instance, open, failure).await;
        }

        for (task, failure) in &abandoned {
            warn!(instance_id = %instance.instance_id, task_id = %task.task_id, %failure, "Optional branch gave up");
        }
        self.close_turn(lease, instance, open).await
    }

    async fn fail_turn(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        open: &OpenTurn,
        failure: &ActivityFailure,
    ) -> Result<Step, EngineError> {
        match self.escalation.record_failure(instance, failure) {
            FailureVerdict::Escalate(ticket) => {
                self.escalate(lease, instance, ticket, open.plan.signal_id.clone()).await?;
                Ok(Step::Continue)
            }
            FailureVerdict::Retry { consecutive_failures } => {
                let due_at = self.clock.now_ms() + self.config.failure_backoff_ms;
                let mut plan = TransitionPlan::to(instance.stage, instance)
                    .with_note("Something went wrong on our side. Retrying shortly.");
                plan.consecutive_failures = consecutive_failures;
                plan.resume_stage = instance.resume_stage;
                plan.retry_not_before = Some(due_at);
                self.transition(lease, instance, plan).await?;
                Ok(Step::Suspend(Suspension::RetryScheduled { due_at }))
            }
        }
    }

    /// Close a turn whose required output failed validation
    ///
    /// The signal is consumed and the stage stays put with a note asking the
    /// user to try again; the failure counter is untouched.
    async fn clarify(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        open: &OpenTurn,
        failure: &ActivityFailure,
    ) -> Result<Step, EngineError> {
        let (to, resume_stage) = match open.plan.kind {
            TurnKind::Interrupt { resume } => (resume, None),
            _ => (instance.stage, instance.resume_stage),
        };
        let mut plan = TransitionPlan::to(to, instance)
            .acking(open.plan.signal_id.clone())
            .with_note(format!("Could not use that answer: {}", failure.message));
        plan.resume_stage = resume_stage;
        self.transition(lease, instance, plan).await?;
        Ok(Step::Continue)
    }

    /// Commit the outputs of a successful turn in one transition
    async fn close_turn(&self, lease: &Lease, instance: &WorkflowInstance, open: &OpenTurn) -> Result<Step, EngineError> {
        let (writes, hint) = collect_writes(instance, open);
        let acks = open.plan.signal_id.clone();

        let mut plan = match open.plan.kind {
            TurnKind::StageWork | TurnKind::Interrupt { .. } if hint == NextHint::Abandon => {
                info!(instance_id = %instance.instance_id, "User abandoned the session");
                TransitionPlan::to(Stage::Failed, instance)
                    .acking(acks)
                    .with_note("abandoned by user")
            }
            TurnKind::StageWork => {
                let plan = TransitionPlan::to(instance.stage, instance).acking(acks);
                match still_missing(instance, &writes, &self.rules) {
                    Some(missing) if hint == NextHint::StageComplete => {
                        plan.with_note(format!("Still needed before moving on: {}", missing.join(", ")))
                    }
                    _ => plan,
                }
            }
            TurnKind::Interrupt { resume } => TransitionPlan::to(resume, instance).acking(acks),
            TurnKind::Prefetch | TurnKind::VendorSearch => TransitionPlan::to(instance.stage, instance),
            TurnKind::StageExit { next } => TransitionPlan::to(next, instance),
        };
        plan.writes = writes;
        plan.consecutive_failures = self.escalation.record_success(instance);

        self.transition(lease, instance, plan).await?;
        Ok(Step::Continue)
    }

    /// Move to ESCALATED with the ticket in the same commit, then deliver it
    async fn escalate(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        ticket: EscalationTicket,
        signal_id: Option<String>,
    ) -> Result<(), EngineError> {
        warn!(
            instance_id = %instance.instance_id,
            ticket_id = %ticket.ticket_id,
            reason = %ticket.reason,
            "Escalating to a human operator"
        );
        let mut plan = TransitionPlan::to(Stage::Escalated, instance)
            .acking(signal_id)
            .with_note(ticket.reason.clone());
        plan.consecutive_failures = ticket.consecutive_failures;
        plan.ticket = Some(ticket);
        self.transition(lease, instance, plan).await?;
        Ok(())
    }

    /// Commit one versioned transition with its snapshot
    async fn transition(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        plan: TransitionPlan,
    ) -> Result<WorkflowInstance, EngineError> {
        let record = TransitionRecord {
            from: instance.stage,
            to: plan.to,
            version: instance.version + 1,
            writes: plan.writes,
            consumed_signals: plan.acks.clone(),
            consecutive_failures: plan.consecutive_failures,
            resume_stage: plan.resume_stage,
            retry_not_before: plan.retry_not_before,
            note: plan.note,
            ticket_id: plan.ticket.as_ref().map(|ticket| ticket.ticket_id.clone()),
            committed_at: self.clock.now_ms(),
        };

        let mut next = instance.clone();
        next.apply_transition(0, &record).map_err(|e| EngineError::Invariant {
            instance_id: instance.instance_id.clone(),
            message: e.to_string(),
        })?;

        let tickets = plan
            .ticket
            .iter()
            .map(EscalationTicket::to_record)
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot = snapshot_record(&next)?;
        self.commit(
            lease,
            instance,
            vec![HistoryEvent::Transition(record)],
            Some(snapshot),
            plan.acks,
            tickets,
        )
        .await?;

        info!(
            instance_id = %instance.instance_id,
            from = %instance.stage,
            to = %next.stage,
            version = next.version,
            "Stage committed"
        );
        self.events
            .emitter_for(instance.instance_id.as_str())
            .stage_committed(instance.stage, next.stage, next.version);
        self.publish(&next).await;

        if let Some(ticket) = &plan.ticket {
            self.escalation.deliver(ticket).await?;
        }
        Ok(next)
    }

    async fn commit(
        &self,
        lease: &Lease,
        instance: &WorkflowInstance,
        events: Vec<HistoryEvent>,
        snapshot: Option<SnapshotRecord>,
        ack_signals: Vec<String>,
        tickets: Vec<TicketRecord>,
    ) -> Result<CommitReceipt, EngineError> {
        let now = self.clock.now_ms();
        let history = events
            .iter()
            .map(|event| event.to_record(now))
            .collect::<Result<Vec<_>, _>>()?;
        let receipt = self
            .state
            .commit(CommitRequest {
                instance_id: instance.instance_id.clone(),
                lease_token: lease.token.clone(),
                expected_generation: instance.generation,
                expected_version: instance.version,
                snapshot,
                history,
                ack_signals,
                tickets,
                now,
                lease_ttl_ms: self.config.lease_ttl_ms,
            })
            .await?;
        Ok(receipt)
    }

    /// Refresh the query projection; readers tolerate a stale one
    async fn publish(&self, instance: &WorkflowInstance) {
        let projection = match projection_record(instance) {
            Ok(projection) => projection,
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Could not encode projection");
                return;
            }
        };
        if let Err(e) = self.state.put_projection(projection).await {
            warn!(instance_id = %instance.instance_id, error = %e, "Failed to publish projection");
        }
    }
}

/// Wait until a cancel or escalate signal is accepted for `instance_id`
async fn critical_signal(events: &mut broadcast::Receiver<FlowEvent>, instance_id: &str) {
    loop {
        match events.recv().await {
            Ok(FlowEvent::SignalAccepted {
                instance_id: id, kind, ..
            }) if id == instance_id && kind.is_critical() => return,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

/// Field writes produced by a settled turn, and the agent's hint
fn collect_writes(instance: &WorkflowInstance, open: &OpenTurn) -> (Vec<FieldWrite>, NextHint) {
    let owner = open.plan.stage;
    let mut writes = open.plan.writes.clone();
    let mut hint = NextHint::Continue;

    for task in &open.plan.tasks {
        let Some(output) = open.completed.get(&task.task_id) else {
            // optional branch that gave up
            if let (OutputTarget::Field(key), Some(failure)) = (&task.target, open.failures.get(&task.task_id)) {
                writes.push(FieldWrite::new(
                    key.clone(),
                    json!({ "unavailable": true, "reason": failure.message }),
                    owner,
                ));
            }
            continue;
        };
        match (&task.target, output) {
            (OutputTarget::AgentUpdates, ActivityOutput::Agent(agent)) => {
                writes.extend(
                    agent
                        .updates
                        .iter()
                        .map(|(key, value)| FieldWrite::new(key.clone(), value.clone(), owner)),
                );
                if agent.next_hint != NextHint::Continue {
                    hint = agent.next_hint;
                }
            }
            (OutputTarget::AgentUpdates, _) => {
                warn!(task_id = %task.task_id, "Non-agent output routed to agent updates, ignored");
            }
            (OutputTarget::Field(key), output) => writes.push(FieldWrite::new(key.clone(), output.as_field_value(), owner)),
            (OutputTarget::FirstRow(key), ActivityOutput::Rows(rows)) => {
                let Some(row) = rows.first() else {
                    continue;
                };
                writes.push(FieldWrite::new(key.clone(), row.clone(), owner));
                // stored profile pre-fills fields the user has not given yet
                if let Some(fields) = row.as_object() {
                    let seeded = fields
                        .iter()
                        .filter(|(field, value)| {
                            !field.trim().is_empty()
                                && !is_reserved_key(field)
                                && !value.is_null()
                                && !instance.session_state.has(field)
                        })
                        .map(|(field, value)| FieldWrite::new(field.clone(), value.clone(), owner));
                    writes.extend(seeded);
                }
            }
            (OutputTarget::FirstRow(key), output) => {
                writes.push(FieldWrite::new(key.clone(), output.as_field_value(), owner))
            }
        }
    }
    (writes, hint)
}

/// Required fields of the current stage still unset after `writes`
fn still_missing(instance: &WorkflowInstance, writes: &[FieldWrite], rules: &RouterRules) -> Option<Vec<String>> {
    let mut state = instance.session_state.clone();
    state.apply(writes, instance.version + 1);
    let missing = state.missing(rules.required_for(instance.stage));
    if missing.is_empty() { None } else { Some(missing) }
}
