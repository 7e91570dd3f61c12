//! Escalation tickets handed to human operators

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sessionstore::TicketRecord;

use super::stage::Stage;

/// Handoff record created exactly once per escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub ticket_id: String,
    pub instance_id: String,
    pub generation: u32,
    /// Version of the escalating commit
    pub version: u64,
    /// Stage the instance was in when it escalated
    pub stage: Stage,
    pub reason: String,
    pub consecutive_failures: u32,
    pub context_snapshot: Map<String, Value>,
    pub created_at: i64,
}

impl EscalationTicket {
    /// Deterministic id so retried commits and redeliveries name the same ticket
    pub fn id_for(instance_id: &str, generation: u32, version: u64) -> String {
        format!("tkt-{instance_id}-g{generation}-v{version}")
    }

    pub fn to_record(&self) -> Result<TicketRecord, serde_json::Error> {
        Ok(TicketRecord {
            ticket_id: self.ticket_id.clone(),
            instance_id: self.instance_id.clone(),
            body: serde_json::to_value(self)?,
            created_at: self.created_at,
            delivered_at: None,
        })
    }

    pub fn from_record(record: &TicketRecord) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record.body.clone())
    }
}
