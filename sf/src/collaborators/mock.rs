//! In-memory collaborators for tests and local dry runs
//!
//! Each fake records what it was asked to do and can be scripted to fail,
//! stall or return canned data.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    CollaboratorError, Collaborators, DomainDataStore, EscalationSink, Notifier, ReasoningAgent, SearchService,
};
use crate::domain::{AgentOutput, EscalationTicket, NextHint, Stage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded agent invocation
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub stage: Stage,
    pub payload: Value,
}

/// Agent that replays scripted replies, or echoes the payload
///
/// Without a script the reply takes `updates`, `hint` and `text` from the
/// signal payload.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripted: Mutex<HashMap<Stage, VecDeque<Result<AgentOutput, CollaboratorError>>>>,
    delay: Duration,
    calls: Mutex<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, stage: Stage, reply: Result<AgentOutput, CollaboratorError>) {
        lock(&self.scripted).entry(stage).or_default().push_back(reply);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn echo(payload: &Value) -> AgentOutput {
        let updates = payload
            .get("updates")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let next_hint = payload
            .get("hint")
            .and_then(|hint| serde_json::from_value::<NextHint>(hint.clone()).ok())
            .unwrap_or_default();
        AgentOutput {
            updates,
            next_hint,
            reply: payload.get("text").and_then(Value::as_str).map(String::from),
        }
    }
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    async fn invoke(
        &self,
        stage: Stage,
        _session_state: &Map<String, Value>,
        payload: &Value,
    ) -> Result<AgentOutput, CollaboratorError> {
        debug!(%stage, "ScriptedAgent::invoke: called");
        lock(&self.calls).push(AgentCall {
            stage,
            payload: payload.clone(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = lock(&self.scripted).get_mut(&stage).and_then(VecDeque::pop_front);
        match scripted {
            Some(reply) => reply,
            None => Ok(Self::echo(payload)),
        }
    }
}

/// Data store honoring idempotency keys
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    rows: Mutex<Vec<Value>>,
    receipts: Mutex<BTreeMap<String, Value>>,
    mutations: Mutex<Vec<Value>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
    write_calls: AtomicUsize,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by every read
    pub fn set_rows(&self, rows: Vec<Value>) {
        *lock(&self.rows) = rows;
    }

    /// Fail the next read or write with `error`
    pub fn fail_next(&self, error: CollaboratorError) {
        lock(&self.failures).push_back(error);
    }

    /// Mutations actually applied (duplicates excluded)
    pub fn applied(&self) -> Vec<Value> {
        lock(&self.mutations).clone()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainDataStore for MemoryDataStore {
    async fn read(&self, _query: &Value) -> Result<Vec<Value>, CollaboratorError> {
        debug!("MemoryDataStore::read: called");
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.rows).clone())
    }

    async fn write(&self, mutation: &Value, idempotency_key: &str) -> Result<Value, CollaboratorError> {
        debug!(%idempotency_key, "MemoryDataStore::write: called");
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        let mut receipts = lock(&self.receipts);
        if let Some(receipt) = receipts.get(idempotency_key) {
            debug!(%idempotency_key, "MemoryDataStore::write: duplicate key, returning stored receipt");
            return Ok(receipt.clone());
        }
        let receipt = json!({ "idempotency_key": idempotency_key, "seq": receipts.len() + 1 });
        receipts.insert(idempotency_key.to_string(), receipt.clone());
        lock(&self.mutations).push(mutation.clone());
        Ok(receipt)
    }
}

/// Search fake with per-query results, failures and stalls
#[derive(Debug, Default)]
pub struct MemorySearch {
    results: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<String, VecDeque<CollaboratorError>>>,
    stalls: Mutex<HashMap<String, (Duration, usize)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_results(&self, query: &str, results: Vec<Value>) {
        lock(&self.results).insert(query.to_string(), results);
    }

    pub fn fail(&self, query: &str, error: CollaboratorError) {
        lock(&self.failures).entry(query.to_string()).or_default().push_back(error);
    }

    /// Sleep for `duration` on the next `times` calls for `query`
    pub fn stall(&self, query: &str, duration: Duration, times: usize) {
        lock(&self.stalls).insert(query.to_string(), (duration, times));
    }

    pub fn calls_for(&self, query: &str) -> usize {
        lock(&self.calls).get(query).copied().unwrap_or(0)
    }

    fn take_stall(&self, query: &str) -> Option<Duration> {
        let mut stalls = lock(&self.stalls);
        let (duration, remaining) = stalls.get_mut(query)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*duration)
    }
}

#[async_trait]
impl SearchService for MemorySearch {
    async fn search(&self, query: &str, _filters: &Value, top_k: usize) -> Result<Vec<Value>, CollaboratorError> {
        debug!(%query, top_k, "MemorySearch::search: called");
        *lock(&self.calls).entry(query.to_string()).or_default() += 1;

        let failure = lock(&self.failures).get_mut(query).and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }
        if let Some(stall) = self.take_stall(query) {
            tokio::time::sleep(stall).await;
        }

        let mut results = lock(&self.results)
            .get(query)
            .cloned()
            .unwrap_or_else(|| vec![json!({ "name": format!("{query} option 1"), "score": 1.0 })]);
        results.truncate(top_k);
        Ok(results)
    }
}

/// Notifier that records deliveries, once per idempotency key
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<BTreeMap<String, (String, String)>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: CollaboratorError) {
        lock(&self.failures).push_back(error);
    }

    /// `(recipient, message)` pairs delivered
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).values().cloned().collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, message: &str, idempotency_key: &str) -> Result<Value, CollaboratorError> {
        debug!(%recipient, %idempotency_key, "RecordingNotifier::send: called");
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.sent)
            .entry(idempotency_key.to_string())
            .or_insert_with(|| (recipient.to_string(), message.to_string()));
        Ok(json!({ "delivered": true, "idempotency_key": idempotency_key }))
    }
}

/// Ticket queue keyed by ticket id
#[derive(Debug, Default)]
pub struct MemoryTicketSink {
    tickets: Mutex<BTreeMap<String, EscalationTicket>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryTicketSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn tickets(&self) -> Vec<EscalationTicket> {
        lock(&self.tickets).values().cloned().collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EscalationSink for MemoryTicketSink {
    async fn create_ticket(&self, ticket: &EscalationTicket) -> Result<String, CollaboratorError> {
        debug!(ticket_id = %ticket.ticket_id, "MemoryTicketSink::create_ticket: called");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("ticket queue offline".to_string()));
        }
        lock(&self.tickets)
            .entry(ticket.ticket_id.clone())
            .or_insert_with(|| ticket.clone());
        Ok(format!("ops/{}", ticket.ticket_id))
    }
}

/// Typed handles to a full set of fakes
#[derive(Debug, Clone, Default)]
pub struct MockCollaborators {
    pub agent: Arc<ScriptedAgent>,
    pub data: Arc<MemoryDataStore>,
    pub search: Arc<MemorySearch>,
    pub notifier: Arc<RecordingNotifier>,
    pub escalation: Arc<MemoryTicketSink>,
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: ScriptedAgent) -> Self {
        self.agent = Arc::new(agent);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            agent: self.agent.clone(),
            data: self.data.clone(),
            search: self.search.clone(),
            notifier: self.notifier.clone(),
            escalation: self.escalation.clone(),
        }
    }
}
