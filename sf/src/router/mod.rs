//! Agent Router
//!
//! Pure function from (stage, session state, next signal) to the next step.
//! No I/O and no clock: the same inputs always produce the same decision,
//! which keeps replayed runs on the path the original run took.

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::domain::{FieldWrite, OutputTarget, SessionState, Signal, SignalKind, Stage, TaskInput, TurnKind};

mod rules;

pub use rules::{NotifyRules, RouterRules, VendorRules};

/// Marker written once the onboarding profile prefetch has run
pub const PREFETCH_MARKER: &str = "_prefetched";

/// Field receiving the prefetched profile rows
pub const PROFILE_FIELD: &str = "profile";

/// Routing failures; every one of them is an engine fault
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("No route from {stage}: {reason}")]
    NoRoute { stage: Stage, reason: String },
}

/// One activity the router wants run
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub input: TaskInput,
    pub target: OutputTarget,
    pub required: bool,
}

impl TaskSpec {
    fn new(input: TaskInput, target: OutputTarget) -> Self {
        Self {
            input,
            target,
            required: true,
        }
    }
}

/// A turn before the engine assigns ids and retry budgets
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSpec {
    pub kind: TurnKind,
    pub stage: Stage,
    /// Signal consumed when the turn commits
    pub signal_id: Option<String>,
    pub tasks: Vec<TaskSpec>,
    pub writes: Vec<FieldWrite>,
}

/// What the engine should do next
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Run activities and commit their results
    Dispatch(TurnSpec),
    /// Move to `to` without running anything
    Advance { to: Stage },
    /// Signal belongs to another stage; park the current one
    Interrupt { target: Stage, signal_id: String },
    /// Nothing to do until a signal arrives
    Await { missing: Vec<String> },
    /// Consume a signal that requires no work
    Acknowledge { signal_id: String },
    Cancel { signal_id: String },
    Escalate { signal_id: String, reason: String },
}

/// Inputs to a routing decision
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub instance_id: &'a str,
    pub stage: Stage,
    pub state: &'a SessionState,
    /// Head of the pending queue (critical signals first)
    pub signal: Option<&'a Signal>,
    /// Where IDLE_INTERRUPT returns to
    pub resume_stage: Option<Stage>,
    pub initial_context: &'a Map<String, Value>,
    pub rules: &'a RouterRules,
}

/// Decide the next step for an instance
pub fn route(input: RouteInput<'_>) -> Result<RouteDecision, RouterError> {
    debug!(instance_id = %input.instance_id, stage = %input.stage, signal = ?input.signal.map(|s| &s.signal_id), "route: called");

    if input.stage.is_terminal() {
        return Err(RouterError::NoRoute {
            stage: input.stage,
            reason: "instance is terminal".to_string(),
        });
    }

    if let Some(signal) = input.signal {
        match signal.kind {
            SignalKind::Cancel => {
                return Ok(RouteDecision::Cancel {
                    signal_id: signal.signal_id.clone(),
                });
            }
            SignalKind::Escalate => {
                let reason = signal
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("escalation requested")
                    .to_string();
                return Ok(RouteDecision::Escalate {
                    signal_id: signal.signal_id.clone(),
                    reason,
                });
            }
            _ => {}
        }
    }

    if input.stage == Stage::IdleInterrupt {
        return route_interrupt(input);
    }

    if let Some(prefetch) = prefetch_turn(&input) {
        return Ok(RouteDecision::Dispatch(prefetch));
    }

    let missing = input.state.missing(input.rules.required_for(input.stage));
    if missing.is_empty() {
        return exit_stage(&input);
    }

    let Some(signal) = input.signal else {
        debug!(?missing, "route: awaiting signal");
        return Ok(RouteDecision::Await { missing });
    };

    if signal.kind == SignalKind::TimerFired {
        return Ok(RouteDecision::Acknowledge {
            signal_id: signal.signal_id.clone(),
        });
    }

    let domain = input.rules.classify(signal.intent.as_deref()).unwrap_or(input.stage);
    if domain != input.stage {
        debug!(target = %domain, "route: off-stage signal, interrupting");
        return Ok(RouteDecision::Interrupt {
            target: domain,
            signal_id: signal.signal_id.clone(),
        });
    }

    if input.stage == Stage::Vendor {
        if let Some(search) = vendor_search_turn(&input, signal) {
            return Ok(RouteDecision::Dispatch(search));
        }
    }

    Ok(RouteDecision::Dispatch(agent_turn(TurnKind::StageWork, input.stage, signal)))
}

fn agent_turn(kind: TurnKind, agent: Stage, signal: &Signal) -> TurnSpec {
    TurnSpec {
        kind,
        stage: agent,
        signal_id: Some(signal.signal_id.clone()),
        tasks: vec![TaskSpec::new(
            TaskInput::AgentCall {
                agent,
                payload: signal.payload.clone(),
            },
            OutputTarget::AgentUpdates,
        )],
        writes: Vec::new(),
    }
}

fn route_interrupt(input: RouteInput<'_>) -> Result<RouteDecision, RouterError> {
    let resume = input.resume_stage.ok_or_else(|| RouterError::NoRoute {
        stage: Stage::IdleInterrupt,
        reason: "no stage to resume".to_string(),
    })?;
    if !resume.is_domain() {
        return Err(RouterError::NoRoute {
            stage: Stage::IdleInterrupt,
            reason: format!("cannot resume into {resume}"),
        });
    }

    match input.signal {
        // the interrupting signal is gone; nothing left to answer
        None => Ok(RouteDecision::Advance { to: resume }),
        Some(signal) if signal.kind == SignalKind::TimerFired => Ok(RouteDecision::Acknowledge {
            signal_id: signal.signal_id.clone(),
        }),
        Some(signal) => {
            let target = input.rules.classify(signal.intent.as_deref()).unwrap_or(resume);
            Ok(RouteDecision::Dispatch(agent_turn(TurnKind::Interrupt { resume }, target, signal)))
        }
    }
}

fn prefetch_turn(input: &RouteInput<'_>) -> Option<TurnSpec> {
    if input.stage != Stage::Onboarding || input.state.has(PREFETCH_MARKER) {
        return None;
    }
    let collection = input.rules.profile_collection.as_ref()?;
    let query = json!({
        "collection": collection,
        "instance_id": input.instance_id,
        "user_id": input.initial_context.get("user_id").cloned().unwrap_or(Value::Null),
    });
    Some(TurnSpec {
        kind: TurnKind::Prefetch,
        stage: Stage::Onboarding,
        signal_id: None,
        tasks: vec![TaskSpec::new(
            TaskInput::DataQuery { query },
            OutputTarget::FirstRow(PROFILE_FIELD.to_string()),
        )],
        writes: vec![FieldWrite::new(PREFETCH_MARKER, Value::Bool(true), Stage::Onboarding)],
    })
}

/// Marker recording a stage's exit action receipt
pub fn exit_marker(stage: Stage) -> String {
    format!("_exit.{}", stage.as_str().to_ascii_lowercase())
}

fn exit_stage(input: &RouteInput<'_>) -> Result<RouteDecision, RouterError> {
    let next = input.stage.next().ok_or_else(|| RouterError::NoRoute {
        stage: input.stage,
        reason: "stage has no successor".to_string(),
    })?;

    if input.stage == Stage::Vendor {
        let recipient = input
            .state
            .get(&input.rules.notify.recipient_field)
            .and_then(Value::as_str)
            .unwrap_or(input.instance_id)
            .to_string();
        return Ok(RouteDecision::Dispatch(TurnSpec {
            kind: TurnKind::StageExit { next },
            stage: input.stage,
            signal_id: None,
            tasks: vec![TaskSpec::new(
                TaskInput::Notify {
                    recipient,
                    message: input.rules.notify.message.clone(),
                },
                OutputTarget::Field(exit_marker(input.stage)),
            )],
            writes: Vec::new(),
        }));
    }

    match input.rules.persist_collections.get(&input.stage) {
        Some(collection) => {
            let mutation = json!({
                "collection": collection,
                "instance_id": input.instance_id,
                "stage": input.stage,
                "fields": input.state.owned_by(input.stage),
            });
            Ok(RouteDecision::Dispatch(TurnSpec {
                kind: TurnKind::StageExit { next },
                stage: input.stage,
                signal_id: None,
                tasks: vec![TaskSpec::new(
                    TaskInput::DataWrite { mutation },
                    OutputTarget::Field(exit_marker(input.stage)),
                )],
                writes: Vec::new(),
            }))
        }
        None => Ok(RouteDecision::Advance { to: next }),
    }
}

fn vendor_search_turn(input: &RouteInput<'_>, signal: &Signal) -> Option<TurnSpec> {
    let rules = &input.rules.vendor;
    let from_signal = signal.payload.get("categories").and_then(Value::as_array);
    let categories: Vec<String> = from_signal
        .or_else(|| input.state.get(&rules.categories_field).and_then(Value::as_array))
        .map(|values| values.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    let pending: Vec<&String> = categories
        .iter()
        .filter(|category| !input.state.has(&format!("{}.{}", rules.results_prefix, category)))
        .collect();
    if pending.is_empty() {
        return None;
    }

    let region = input.state.get(&rules.region_field).cloned().unwrap_or(Value::Null);
    let tasks = pending
        .iter()
        .map(|category| TaskSpec {
            input: TaskInput::Search {
                query: category.to_string(),
                filters: json!({ "category": category, "region": region }),
                top_k: rules.top_k,
            },
            target: OutputTarget::Field(format!("{}.{}", rules.results_prefix, category)),
            required: rules.required,
        })
        .collect();

    let mut writes = Vec::new();
    if from_signal.is_some() {
        writes.push(FieldWrite::new(
            rules.categories_field.clone(),
            Value::from(categories.clone()),
            Stage::Vendor,
        ));
    }

    Some(TurnSpec {
        kind: TurnKind::VendorSearch,
        stage: Stage::Vendor,
        signal_id: None,
        tasks,
        writes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        state: SessionState,
        context: Map<String, Value>,
        rules: RouterRules,
    }

    impl Fixture {
        fn new() -> Self {
            let mut state = SessionState::new();
            state.apply(&[FieldWrite::new(PREFETCH_MARKER, json!(true), Stage::Onboarding)], 1);
            Self {
                state,
                context: Map::new(),
                rules: RouterRules::default(),
            }
        }

        fn set(&mut self, key: &str, value: Value, owner: Stage) {
            self.state.apply(&[FieldWrite::new(key, value, owner)], 2);
        }

        fn route(&self, stage: Stage, signal: Option<&Signal>, resume: Option<Stage>) -> Result<RouteDecision, RouterError> {
            route(RouteInput {
                instance_id: "sess-1",
                stage,
                state: &self.state,
                signal,
                resume_stage: resume,
                initial_context: &self.context,
                rules: &self.rules,
            })
        }
    }

    fn message(id: &str, payload: Value) -> Signal {
        Signal::user_message(id, payload)
    }

    #[test]
    fn test_terminal_has_no_route() {
        let fixture = Fixture::new();
        for stage in [Stage::Completed, Stage::Failed, Stage::Escalated] {
            assert!(matches!(fixture.route(stage, None, None), Err(RouterError::NoRoute { .. })));
        }
    }

    #[test]
    fn test_onboarding_prefetches_profile_first() {
        let mut fixture = Fixture::new();
        fixture.state = SessionState::new();
        fixture.context.insert("user_id".to_string(), json!("u-7"));

        let RouteDecision::Dispatch(turn) = fixture.route(Stage::Onboarding, None, None).unwrap() else {
            panic!("expected prefetch dispatch");
        };
        assert_eq!(turn.kind, TurnKind::Prefetch);
        assert!(turn.signal_id.is_none());
        assert_eq!(turn.writes[0].key, PREFETCH_MARKER);
        let TaskInput::DataQuery { query } = &turn.tasks[0].input else {
            panic!("expected data query");
        };
        assert_eq!(query["user_id"], "u-7");
        assert_eq!(turn.tasks[0].target, OutputTarget::FirstRow(PROFILE_FIELD.to_string()));
    }

    #[test]
    fn test_prefetch_disabled_by_rules() {
        let mut fixture = Fixture::new();
        fixture.state = SessionState::new();
        fixture.rules.profile_collection = None;
        let decision = fixture.route(Stage::Onboarding, None, None).unwrap();
        assert!(matches!(decision, RouteDecision::Await { .. }));
    }

    #[test]
    fn test_awaits_signal_with_missing_fields() {
        let fixture = Fixture::new();
        let decision = fixture.route(Stage::Onboarding, None, None).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Await {
                missing: vec!["display_name".to_string(), "email".to_string(), "wedding_date".to_string()]
            }
        );
    }

    #[test]
    fn test_same_stage_signal_goes_to_stage_agent() {
        let fixture = Fixture::new();
        let signal = message("m-1", json!({ "text": "I'm Asha" }));
        let RouteDecision::Dispatch(turn) = fixture.route(Stage::Onboarding, Some(&signal), None).unwrap() else {
            panic!("expected dispatch");
        };
        assert_eq!(turn.kind, TurnKind::StageWork);
        assert_eq!(turn.signal_id.as_deref(), Some("m-1"));
        assert!(matches!(
            turn.tasks[0].input,
            TaskInput::AgentCall {
                agent: Stage::Onboarding,
                ..
            }
        ));
    }

    #[test]
    fn test_off_stage_intent_interrupts() {
        let fixture = Fixture::new();
        let signal = message("m-2", json!({ "text": "how much do venues cost?" })).with_intent("budget");
        assert_eq!(
            fixture.route(Stage::Preferences, Some(&signal), None).unwrap(),
            RouteDecision::Interrupt {
                target: Stage::Budget,
                signal_id: "m-2".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_intent_stays_in_stage() {
        let fixture = Fixture::new();
        let signal = message("m-3", json!({})).with_intent("weather");
        let decision = fixture.route(Stage::Preferences, Some(&signal), None).unwrap();
        assert!(matches!(decision, RouteDecision::Dispatch(TurnSpec { kind: TurnKind::StageWork, .. })));
    }

    #[test]
    fn test_interrupt_dispatches_target_agent_and_resumes() {
        let fixture = Fixture::new();
        let signal = message("m-2", json!({})).with_intent("budget");
        let RouteDecision::Dispatch(turn) = fixture
            .route(Stage::IdleInterrupt, Some(&signal), Some(Stage::Preferences))
            .unwrap()
        else {
            panic!("expected dispatch");
        };
        assert_eq!(
            turn.kind,
            TurnKind::Interrupt {
                resume: Stage::Preferences
            }
        );
        assert_eq!(turn.stage, Stage::Budget);
    }

    #[test]
    fn test_interrupt_without_resume_is_fault() {
        let fixture = Fixture::new();
        let signal = message("m-2", json!({}));
        assert!(fixture.route(Stage::IdleInterrupt, Some(&signal), None).is_err());
        assert_eq!(
            fixture.route(Stage::IdleInterrupt, None, Some(Stage::Budget)).unwrap(),
            RouteDecision::Advance { to: Stage::Budget }
        );
    }

    #[test]
    fn test_critical_signals_win() {
        let fixture = Fixture::new();
        let cancel = Signal::cancel("c-1");
        assert_eq!(
            fixture.route(Stage::Budget, Some(&cancel), None).unwrap(),
            RouteDecision::Cancel {
                signal_id: "c-1".to_string()
            }
        );
        let escalate = Signal::escalate("e-1", "wants a human");
        assert_eq!(
            fixture.route(Stage::IdleInterrupt, Some(&escalate), Some(Stage::Budget)).unwrap(),
            RouteDecision::Escalate {
                signal_id: "e-1".to_string(),
                reason: "wants a human".to_string()
            }
        );
    }

    #[test]
    fn test_completed_stage_persists_before_advancing() {
        let mut fixture = Fixture::new();
        fixture.set("display_name", json!("Asha"), Stage::Onboarding);
        fixture.set("email", json!("asha@example.com"), Stage::Onboarding);
        fixture.set("wedding_date", json!("2027-02-14"), Stage::Onboarding);

        let RouteDecision::Dispatch(turn) = fixture.route(Stage::Onboarding, None, None).unwrap() else {
            panic!("expected exit action");
        };
        assert_eq!(
            turn.kind,
            TurnKind::StageExit {
                next: Stage::Preferences
            }
        );
        let TaskInput::DataWrite { mutation } = &turn.tasks[0].input else {
            panic!("expected data write");
        };
        assert_eq!(mutation["collection"], "users");
        assert_eq!(mutation["fields"]["email"], "asha@example.com");
    }

    #[test]
    fn test_stage_without_exit_action_advances() {
        let mut fixture = Fixture::new();
        fixture.rules.persist_collections.clear();
        fixture.set("budget.total", json!(40000), Stage::Budget);
        assert_eq!(
            fixture.route(Stage::Budget, None, None).unwrap(),
            RouteDecision::Advance { to: Stage::Vendor }
        );
    }

    #[test]
    fn test_vendor_completion_notifies() {
        let mut fixture = Fixture::new();
        fixture.set("email", json!("asha@example.com"), Stage::Onboarding);
        fixture.set("vendor.shortlist", json!(["Lotus Hall"]), Stage::Vendor);
        let RouteDecision::Dispatch(turn) = fixture.route(Stage::Vendor, None, None).unwrap() else {
            panic!("expected notify");
        };
        assert_eq!(turn.kind, TurnKind::StageExit { next: Stage::Completed });
        let TaskInput::Notify { recipient, .. } = &turn.tasks[0].input else {
            panic!("expected notify task");
        };
        assert_eq!(recipient, "asha@example.com");
    }

    #[test]
    fn test_vendor_fans_out_missing_categories() {
        let mut fixture = Fixture::new();
        fixture.set("preferences.region", json!("Kerala"), Stage::Preferences);
        fixture.set("vendor.results.venue", json!([{ "name": "Lotus Hall" }]), Stage::Vendor);
        let signal = message("m-4", json!({ "categories": ["venue", "caterer", "decor"] }));

        let RouteDecision::Dispatch(turn) = fixture.route(Stage::Vendor, Some(&signal), None).unwrap() else {
            panic!("expected search fan-out");
        };
        assert_eq!(turn.kind, TurnKind::VendorSearch);
        assert!(turn.signal_id.is_none());
        let queries: Vec<&str> = turn
            .tasks
            .iter()
            .map(|task| match &task.input {
                TaskInput::Search { query, .. } => query.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(queries, vec!["caterer", "decor"]);
        assert_eq!(turn.writes[0].key, "vendor.categories");
    }

    #[test]
    fn test_vendor_agent_after_results_present() {
        let mut fixture = Fixture::new();
        fixture.set("vendor.categories", json!(["venue"]), Stage::Vendor);
        fixture.set("vendor.results.venue", json!([]), Stage::Vendor);
        let signal = message("m-5", json!({ "text": "shortlist the first one" }));
        let decision = fixture.route(Stage::Vendor, Some(&signal), None).unwrap();
        assert!(matches!(decision, RouteDecision::Dispatch(TurnSpec { kind: TurnKind::StageWork, .. })));
    }

    #[test]
    fn test_timer_signal_is_acknowledged() {
        let fixture = Fixture::new();
        let timer = Signal::new("t-1", SignalKind::TimerFired, Value::Null);
        assert_eq!(
            fixture.route(Stage::Budget, Some(&timer), None).unwrap(),
            RouteDecision::Acknowledge {
                signal_id: "t-1".to_string()
            }
        );
    }

    #[test]
    fn test_route_is_deterministic() {
        let fixture = Fixture::new();
        let signal = message("m-1", json!({ "text": "hi" }));
        let first = fixture.route(Stage::Onboarding, Some(&signal), None).unwrap();
        let second = fixture.route(Stage::Onboarding, Some(&signal), None).unwrap();
        assert_eq!(first, second);
    }
}
