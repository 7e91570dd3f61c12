//! End-to-end engine scenarios against in-memory collaborators

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::collaborators::{CollaboratorError, Collaborators, DomainDataStore, Notifier};
use crate::collaborators::mock::{MockCollaborators, ScriptedAgent};
use crate::config::Config;
use crate::domain::{AgentOutput, HistoryEvent, NextHint, Signal, Stage, TransitionRecord};
use crate::events::EventBus;
use crate::executor::{RetryConfig, RetryPolicy};
use crate::signals::SignalOutcome;
use crate::state::StateManager;

const ID: &str = "sess-test";
const T0: i64 = 1_000_000;

fn test_config() -> Config {
    let mut config = Config::default();
    config.runner.worker_id = Some("worker-a".to_string());
    let policy = RetryPolicy {
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        max_attempts: 4,
        timeout_ms: 5_000,
        jitter: false,
    };
    config.retry = RetryConfig {
        default: policy.clone(),
        agent_call: None,
        data_query: None,
        data_write: None,
        notify: None,
        search: Some(RetryPolicy {
            timeout_ms: 50,
            ..policy
        }),
    };
    config.router.profile_collection = None;
    config
}

struct Harness {
    engine: WorkflowEngine,
    mocks: MockCollaborators,
    clock: Arc<ManualClock>,
    state: StateManager,
}

impl Harness {
    fn new() -> Self {
        Self::with(test_config(), MockCollaborators::new())
    }

    fn with(config: Config, mocks: MockCollaborators) -> Self {
        let collaborators = mocks.collaborators();
        Self::with_collaborators(config, mocks, collaborators)
    }

    fn with_collaborators(config: Config, mocks: MockCollaborators, collaborators: Collaborators) -> Self {
        let state = StateManager::spawn_in_memory().unwrap();
        let clock = ManualClock::new(T0);
        let engine = WorkflowEngine::new(
            &config,
            state.clone(),
            collaborators,
            Arc::new(EventBus::new(256)),
            clock.clone(),
        );
        Self {
            engine,
            mocks,
            clock,
            state,
        }
    }

    async fn start(&self) -> InstanceHandle {
        self.engine.start(ID, Map::new()).await.unwrap()
    }

    async fn send(&self, signal: Signal) {
        let outcome = self.engine.signal(ID, signal).await.unwrap();
        assert!(outcome.is_accepted(), "signal not accepted: {outcome:?}");
    }

    async fn run(&self) -> RunOutcome {
        self.engine.run_to_next_suspension(ID).await.unwrap()
    }

    async fn view(&self) -> WorkflowInstanceView {
        self.engine.query(ID).await.unwrap()
    }

    async fn transitions(&self) -> Vec<TransitionRecord> {
        self.engine
            .client()
            .history(ID, None)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|entry| match entry.event {
                HistoryEvent::Transition(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Fill onboarding and preferences; leaves the instance in BUDGET
    async fn reach_budget(&self) {
        self.start().await;
        self.send(updates("m-onboarding", onboarding())).await;
        self.run().await;
        self.send(updates("m-preferences", preferences())).await;
        let outcome = self.run().await;
        assert_eq!(outcome.handle.stage, Stage::Budget);
    }

    async fn reach_vendor(&self) {
        self.reach_budget().await;
        self.send(updates("m-budget", json!({ "budget.total": 25_000 }))).await;
        let outcome = self.run().await;
        assert_eq!(outcome.handle.stage, Stage::Vendor);
    }
}

fn updates(signal_id: &str, updates: Value) -> Signal {
    Signal::user_message(signal_id, json!({ "updates": updates }))
}

fn onboarding() -> Value {
    json!({ "display_name": "Asha", "email": "asha@example.com", "wedding_date": "2027-06-12" })
}

fn preferences() -> Value {
    json!({ "preferences.region": "Lisbon", "preferences.culture": "Goan", "preferences.guest_count": 120 })
}

fn awaiting(outcome: &RunOutcome) -> Vec<String> {
    match &outcome.suspension {
        Suspension::AwaitingSignal { missing, .. } => missing.clone(),
        other => panic!("expected AwaitingSignal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fresh_instance_awaits_onboarding_fields() {
    let h = Harness::new();
    h.start().await;

    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Onboarding);
    assert_eq!(outcome.handle.version, 0);
    assert_eq!(awaiting(&outcome), vec!["display_name", "email", "wedding_date"]);
}

#[tokio::test]
async fn test_full_session_reaches_completed() {
    let h = Harness::new();
    h.reach_vendor().await;

    h.send(Signal::user_message(
        "m-vendor",
        json!({ "categories": ["venue"], "updates": { "vendor.shortlist": ["Quinta da Regaleira"] } }),
    ))
    .await;
    let outcome = h.run().await;
    assert_eq!(
        outcome.suspension,
        Suspension::Terminal {
            stage: Stage::Completed
        }
    );

    let view = h.view().await;
    assert_eq!(view.stage, Stage::Completed);
    assert_eq!(view.session_state["vendor.shortlist"], json!(["Quinta da Regaleira"]));
    assert_eq!(view.session_state["budget.total"], json!(25_000));
    assert_eq!(view.status, "Your plan is complete.");

    let sent = h.mocks.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "asha@example.com");

    // onboarding, preferences and budget each persist once on exit
    assert_eq!(h.mocks.data.applied().len(), 3);
    assert!(h.state.pending_signals(ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stages_advance_in_order() {
    let h = Harness::new();
    h.reach_vendor().await;
    h.send(updates("m-vendor", json!({ "vendor.shortlist": ["Quinta"] })))
        .await;
    h.run().await;

    let transitions = h.transitions().await;
    let changes: Vec<(Stage, Stage)> = transitions
        .iter()
        .filter(|t| t.from != t.to)
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        changes,
        vec![
            (Stage::Onboarding, Stage::Preferences),
            (Stage::Preferences, Stage::Budget),
            (Stage::Budget, Stage::Vendor),
            (Stage::Vendor, Stage::Completed),
        ]
    );
    for (i, transition) in transitions.iter().enumerate() {
        assert_eq!(transition.version, i as u64 + 1);
    }
}

#[tokio::test]
async fn test_rerun_is_idempotent_and_matches_replay() {
    let h = Harness::new();
    h.reach_budget().await;
    let before = h.engine.client().history(ID, None).await.unwrap();
    let agent_calls = h.mocks.agent.call_count();

    let outcome = h.run().await;
    assert_eq!(awaiting(&outcome), vec!["budget.total"]);
    assert_eq!(h.engine.client().history(ID, None).await.unwrap(), before);
    assert_eq!(h.mocks.agent.call_count(), agent_calls);

    let records = h.state.read_history(ID, None).await.unwrap();
    let rebuilt = replay(ID, &records).unwrap();
    let view = h.view().await;
    assert_eq!(WorkflowInstanceView::of(&rebuilt), view);

    let snapshot = h.state.load_snapshot_required(ID).await.unwrap();
    let from_snapshot: WorkflowInstanceView = serde_json::from_value(snapshot.body).unwrap();
    assert_eq!(from_snapshot, view);
}

#[tokio::test]
async fn test_exit_write_retries_and_applies_once() {
    let h = Harness::new();
    h.start().await;
    h.mocks
        .data
        .fail_next(CollaboratorError::Unavailable("db restarting".to_string()));
    h.send(updates("m-onboarding", onboarding())).await;

    let outcome = h.run().await;
    assert_eq!(outcome.suspension, Suspension::RetryScheduled { due_at: T0 + 1_000 });
    assert_eq!(outcome.handle.stage, Stage::Onboarding);
    assert!(h.view().await.turn_open);

    // not due yet
    let early = h.run().await;
    assert_eq!(early.suspension, Suspension::RetryScheduled { due_at: T0 + 1_000 });
    assert_eq!(h.mocks.data.write_calls(), 1);

    h.clock.advance(1_000);
    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Preferences);
    assert_eq!(h.mocks.data.write_calls(), 2);
    assert_eq!(h.mocks.data.applied().len(), 1);

    h.run().await;
    assert_eq!(h.mocks.data.applied().len(), 1);
}

/// Applies every new key, then drops the acknowledgement of the first `lost` calls
struct LostAckStore {
    applied: Mutex<BTreeSet<String>>,
    calls: AtomicUsize,
    lost: usize,
}

impl LostAckStore {
    fn new(lost: usize) -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(BTreeSet::new()),
            calls: AtomicUsize::new(0),
            lost,
        })
    }

    fn apply(&self, key: &str) -> Result<Value, CollaboratorError> {
        self.applied.lock().unwrap().insert(key.to_string());
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.lost {
            return Err(CollaboratorError::Unavailable("connection reset".to_string()));
        }
        Ok(json!({ "idempotency_key": key }))
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().iter().cloned().collect()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainDataStore for LostAckStore {
    async fn read(&self, _query: &Value) -> Result<Vec<Value>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn write(&self, _mutation: &Value, idempotency_key: &str) -> Result<Value, CollaboratorError> {
        self.apply(idempotency_key)
    }
}

#[async_trait]
impl Notifier for LostAckStore {
    async fn send(&self, _recipient: &str, _message: &str, idempotency_key: &str) -> Result<Value, CollaboratorError> {
        self.apply(idempotency_key)
    }
}

/// Run, advancing the clock past each retry, until `stage` is reached
async fn run_until(h: &Harness, stage: Stage) {
    let mut outcome = h.run().await;
    for _ in 0..10 {
        if outcome.handle.stage == stage {
            return;
        }
        h.clock.advance(10_000);
        outcome = h.run().await;
    }
    assert_eq!(outcome.handle.stage, stage);
}

#[tokio::test]
async fn test_failed_exit_write_is_redispatched_under_the_same_key() {
    let mocks = MockCollaborators::new();
    let store = LostAckStore::new(4);
    let collaborators = Collaborators {
        data: store.clone(),
        ..mocks.collaborators()
    };
    let h = Harness::with_collaborators(test_config(), mocks, collaborators);
    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;

    run_until(&h, Stage::Preferences).await;

    // four lost acks use up the turn; the re-dispatched exit succeeds
    assert_eq!(store.calls(), 5);
    assert_eq!(store.applied(), vec![format!("{ID}:g1:ONBOARDING:exit:0")]);
    let retried = h
        .transitions()
        .await
        .iter()
        .any(|t| t.from == Stage::Onboarding && t.to == Stage::Onboarding);
    assert!(retried);
    assert_eq!(h.view().await.consecutive_failures, 0);
}

#[tokio::test]
async fn test_vendor_completion_notifies_once_despite_lost_acks() {
    let mocks = MockCollaborators::new();
    let store = LostAckStore::new(4);
    let collaborators = Collaborators {
        notifier: store.clone(),
        ..mocks.collaborators()
    };
    let h = Harness::with_collaborators(test_config(), mocks, collaborators);
    h.reach_vendor().await;
    h.send(updates("m-vendor", json!({ "vendor.shortlist": ["Quinta"] })))
        .await;

    run_until(&h, Stage::Completed).await;

    assert_eq!(store.calls(), 5);
    assert_eq!(store.applied(), vec![format!("{ID}:g1:VENDOR:exit:0")]);
}

#[tokio::test]
async fn test_lease_held_elsewhere_blocks_run() {
    let h = Harness::new();
    h.start().await;
    h.state
        .acquire_lease(ID, "worker-b", "token-b", h.clock.now_ms(), 60_000)
        .await
        .unwrap();

    let outcome = h.run().await;
    assert_eq!(
        outcome.suspension,
        Suspension::LeaseHeld {
            owner: "worker-b".to_string(),
            expires_at: T0 + 60_000
        }
    );
    assert_eq!(outcome.steps, 0);
    assert_eq!(outcome.suspension.wake_at(), Some(T0 + 60_000));
}

#[tokio::test]
async fn test_lease_is_renewed_during_a_slow_agent_call() {
    let mut config = test_config();
    config.engine.lease_ttl_ms = 300;
    let mocks = MockCollaborators::new().with_agent(ScriptedAgent::new().with_delay(Duration::from_millis(600)));
    let h = Harness::with(config, mocks.clone());
    let mut other_config = test_config();
    other_config.runner.worker_id = Some("worker-b".to_string());
    let other = WorkflowEngine::new(
        &other_config,
        h.state.clone(),
        mocks.collaborators(),
        Arc::new(EventBus::new(64)),
        h.clock.clone(),
    );

    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;
    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.run_to_next_suspension(ID).await });

    // the lease taken at T0 would have lapsed by now without renewal
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.clock.advance(400);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let contender = other.run_to_next_suspension(ID).await.unwrap();
    assert!(
        matches!(&contender.suspension, Suspension::LeaseHeld { owner, .. } if owner == "worker-a"),
        "expected lease held by worker-a, got {:?}",
        contender.suspension
    );

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.handle.stage, Stage::Preferences);
    assert_eq!(mocks.agent.call_count(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_never_commit_twice() {
    let mocks = MockCollaborators::new().with_agent(ScriptedAgent::new().with_delay(Duration::from_millis(100)));
    let h = Harness::with(test_config(), mocks.clone());
    let mut other_config = test_config();
    other_config.runner.worker_id = Some("worker-b".to_string());
    let other = WorkflowEngine::new(
        &other_config,
        h.state.clone(),
        mocks.collaborators(),
        Arc::new(EventBus::new(64)),
        h.clock.clone(),
    );

    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;

    let (a, b) = tokio::join!(h.engine.run_to_next_suspension(ID), other.run_to_next_suspension(ID));
    let outcomes = [a.unwrap(), b.unwrap()];
    let held = outcomes
        .iter()
        .filter(|outcome| matches!(outcome.suspension, Suspension::LeaseHeld { .. }))
        .count();
    assert_eq!(held, 1);
    assert_eq!(mocks.agent.call_count(), 1);

    let versions: Vec<u64> = h.transitions().await.iter().map(|t| t.version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_escalates_after_three_failed_turns() {
    let agent = ScriptedAgent::new();
    for _ in 0..3 {
        agent.push(
            Stage::Onboarding,
            Err(CollaboratorError::Rejected {
                status: 422,
                message: "cannot parse".to_string(),
            }),
        );
    }
    let h = Harness::with(test_config(), MockCollaborators::new().with_agent(agent));
    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;

    let first = h.run().await;
    assert_eq!(first.suspension, Suspension::RetryScheduled { due_at: T0 + 5_000 });
    assert_eq!(h.view().await.consecutive_failures, 1);

    h.clock.advance(5_000);
    let second = h.run().await;
    assert!(matches!(second.suspension, Suspension::RetryScheduled { .. }));
    assert_eq!(h.view().await.consecutive_failures, 2);

    h.clock.advance(5_000);
    let third = h.run().await;
    assert_eq!(
        third.suspension,
        Suspension::Terminal {
            stage: Stage::Escalated
        }
    );

    let tickets = h.mocks.escalation.tickets();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].consecutive_failures, 3);
    assert_eq!(tickets[0].stage, Stage::Onboarding);

    let view = h.view().await;
    assert_eq!(view.status, OPERATOR_MESSAGE);
    assert_eq!(view.ticket_id.as_deref(), Some(tickets[0].ticket_id.as_str()));

    let stored = h.engine.client().tickets(Some(ID), false).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].delivered_at.is_some());

    // terminal: nothing more happens
    let again = h.run().await;
    assert_eq!(again.steps, 0);
    assert_eq!(h.mocks.escalation.calls(), 1);
    assert_eq!(
        h.engine.signal(ID, updates("late", json!({}))).await.unwrap(),
        SignalOutcome::IgnoredTerminal
    );
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let agent = ScriptedAgent::new();
    agent.push(
        Stage::Onboarding,
        Err(CollaboratorError::Rejected {
            status: 400,
            message: "bad request".to_string(),
        }),
    );
    let h = Harness::with(test_config(), MockCollaborators::new().with_agent(agent));
    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;

    h.run().await;
    assert_eq!(h.view().await.consecutive_failures, 1);

    h.clock.advance(5_000);
    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Preferences);
    assert_eq!(h.view().await.consecutive_failures, 0);
}

#[tokio::test]
async fn test_invalid_agent_output_asks_for_clarification() {
    let agent = ScriptedAgent::new();
    agent.push(
        Stage::Onboarding,
        Err(CollaboratorError::InvalidOutput("date unreadable".to_string())),
    );
    let h = Harness::with(test_config(), MockCollaborators::new().with_agent(agent));
    h.start().await;
    h.send(updates("m-onboarding", json!({ "wedding_date": "soon" }))).await;

    let outcome = h.run().await;
    match &outcome.suspension {
        Suspension::AwaitingSignal { clarification, .. } => {
            assert_eq!(
                clarification.as_deref(),
                Some("Could not use that answer: Invalid output: date unreadable")
            );
        }
        other => panic!("expected AwaitingSignal, got {other:?}"),
    }
    let view = h.view().await;
    assert_eq!(view.stage, Stage::Onboarding);
    assert_eq!(view.consecutive_failures, 0);
    assert!(h.state.pending_signals(ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_off_stage_signal_round_trips_through_interrupt() {
    let agent = ScriptedAgent::new();
    let mut found = Map::new();
    found.insert("vendor.interest".to_string(), json!("Sintra"));
    agent.push(
        Stage::Vendor,
        Ok(AgentOutput {
            updates: found,
            next_hint: NextHint::Continue,
            reply: Some("Several quintas near Sintra host weddings.".to_string()),
        }),
    );
    let h = Harness::with(test_config(), MockCollaborators::new().with_agent(agent));
    h.reach_budget().await;
    let entry = h.view().await.version;

    h.send(Signal::user_message("m-venues", json!({ "text": "do you know venues in Sintra?" })).with_intent("vendor"))
        .await;
    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Budget);
    assert_eq!(awaiting(&outcome), vec!["budget.total"]);

    let calls = h.mocks.agent.calls();
    assert_eq!(calls.last().map(|call| call.stage), Some(Stage::Vendor));

    let tail: Vec<(Stage, Stage, u64)> = h
        .transitions()
        .await
        .iter()
        .filter(|t| t.version > entry)
        .map(|t| (t.from, t.to, t.version))
        .collect();
    assert_eq!(
        tail,
        vec![
            (Stage::Budget, Stage::IdleInterrupt, entry + 1),
            (Stage::IdleInterrupt, Stage::Budget, entry + 2),
        ]
    );

    let view = h.view().await;
    assert_eq!(view.version, entry + 2);
    assert_eq!(view.stage, Stage::Budget);
    assert_eq!(view.resume_stage, None);
    assert_eq!(view.session_state["vendor.interest"], json!("Sintra"));
    assert_eq!(view.reply.as_deref(), Some("Several quintas near Sintra host weddings."));
    assert!(h.state.pending_signals(ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_preference_answer_during_onboarding_is_kept() {
    let h = Harness::new();
    h.start().await;
    h.send(updates("m-prefs", preferences()).with_intent("preference")).await;

    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Onboarding);
    assert_eq!(awaiting(&outcome), vec!["display_name", "email", "wedding_date"]);

    let view = h.view().await;
    assert_eq!(view.session_state["preferences.region"], json!("Lisbon"));

    // once onboarding is filled, preferences are already satisfied
    h.send(updates("m-onboarding", onboarding())).await;
    let outcome = h.run().await;
    assert_eq!(outcome.handle.stage, Stage::Budget);
}

#[tokio::test]
async fn test_vendor_fanout_retries_slow_branch_only() {
    let h = Harness::new();
    h.reach_vendor().await;
    let entry_version = h.view().await.version;
    h.mocks.search.stall("caterer", Duration::from_millis(500), 2);

    h.send(Signal::user_message(
        "m-vendor",
        json!({ "categories": ["venue", "caterer"] }),
    ))
    .await;

    let first = h.run().await;
    assert_eq!(first.suspension, Suspension::RetryScheduled { due_at: T0 + 1_000 });
    assert_eq!(first.handle.version, entry_version);

    h.clock.advance(1_000);
    let second = h.run().await;
    assert_eq!(second.suspension, Suspension::RetryScheduled { due_at: T0 + 3_000 });

    h.clock.advance(2_000);
    let third = h.run().await;
    assert_eq!(awaiting(&third), vec!["vendor.shortlist"]);

    assert_eq!(h.mocks.search.calls_for("venue"), 1);
    assert_eq!(h.mocks.search.calls_for("caterer"), 3);

    let fanout = h
        .transitions()
        .await
        .into_iter()
        .find(|t| t.writes.iter().any(|w| w.key == "vendor.results.caterer"))
        .unwrap();
    assert_eq!(fanout.version, entry_version + 1);
    assert!(fanout.writes.iter().any(|w| w.key == "vendor.results.venue"));

    let view = h.view().await;
    assert_eq!(view.session_state["vendor.categories"], json!(["venue", "caterer"]));
}

#[tokio::test]
async fn test_cancel_fails_instance_and_restart_opens_new_generation() {
    let h = Harness::new();
    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;
    h.send(Signal::cancel("c-1")).await;

    let outcome = h.run().await;
    assert_eq!(outcome.suspension, Suspension::Terminal { stage: Stage::Failed });
    assert_eq!(h.mocks.agent.call_count(), 0);
    assert_eq!(h.view().await.status, OPERATOR_MESSAGE);

    let restarted = h.start().await;
    assert_eq!(restarted.generation, 2);
    assert_eq!(restarted.version, 0);
    assert_eq!(restarted.stage, Stage::Onboarding);

    let first_generation = h.engine.client().history(ID, Some(1)).await.unwrap();
    assert!(matches!(
        first_generation.last().map(|entry| &entry.event),
        Some(HistoryEvent::Transition(record)) if record.to == Stage::Failed
    ));
    // stale signals from the old generation are gone
    assert!(h.state.pending_signals(ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_escalate_signal_creates_ticket_with_reason() {
    let h = Harness::new();
    h.reach_budget().await;
    h.send(Signal::escalate("e-1", "wants to talk to a planner")).await;

    let outcome = h.run().await;
    assert_eq!(
        outcome.suspension,
        Suspension::Terminal {
            stage: Stage::Escalated
        }
    );
    let tickets = h.mocks.escalation.tickets();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].reason, "wants to talk to a planner");
    assert_eq!(tickets[0].stage, Stage::Budget);
    assert!(tickets[0].context_snapshot.get("budget.total").is_none());
    assert_eq!(tickets[0].context_snapshot["email"], json!("asha@example.com"));
}

#[tokio::test]
async fn test_cancel_preempts_in_flight_agent_call() {
    let mocks = MockCollaborators::new().with_agent(ScriptedAgent::new().with_delay(Duration::from_secs(30)));
    let h = Harness::with(test_config(), mocks);
    h.start().await;
    h.send(updates("m-onboarding", onboarding())).await;

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.run_to_next_suspension(ID).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.send(Signal::cancel("c-1")).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.suspension, Suspension::Terminal { stage: Stage::Failed });
}

#[tokio::test]
async fn test_stored_profile_prefills_onboarding() {
    let mut config = test_config();
    config.router.profile_collection = Some("users".to_string());
    let h = Harness::with(config, MockCollaborators::new());
    h.mocks
        .data
        .set_rows(vec![json!({ "display_name": "Asha", "email": "asha@example.com", "_internal": 1 })]);
    h.start().await;

    let outcome = h.run().await;
    assert_eq!(awaiting(&outcome), vec!["wedding_date"]);

    let view = h.view().await;
    assert_eq!(view.session_state["display_name"], json!("Asha"));
    assert!(view.session_state.contains_key("profile"));
    assert!(!view.session_state.contains_key("_internal"));

    // prefetch runs once per generation
    h.run().await;
    assert_eq!(h.transitions().await.len(), 1);
}

#[tokio::test]
async fn test_abandon_hint_fails_session() {
    let agent = ScriptedAgent::new();
    agent.push(
        Stage::Onboarding,
        Ok(AgentOutput {
            next_hint: NextHint::Abandon,
            ..AgentOutput::default()
        }),
    );
    let h = Harness::with(test_config(), MockCollaborators::new().with_agent(agent));
    h.start().await;
    h.send(updates("m-bye", json!({}))).await;

    let outcome = h.run().await;
    assert_eq!(outcome.suspension, Suspension::Terminal { stage: Stage::Failed });
    assert_eq!(h.view().await.note.as_deref(), Some("abandoned by user"));
}
