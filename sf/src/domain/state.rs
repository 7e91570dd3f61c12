//! Session state: versioned fields with ownership lineage

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::stage::Stage;

/// Keys starting with this prefix belong to the engine, not to agents
pub const RESERVED_PREFIX: char = '_';

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// One past write of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRevision {
    pub version: u64,
    pub owner: Stage,
}

/// Current value of a field and who wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: Value,
    /// Stage that last wrote the field
    pub owner: Stage,
    /// Instance version that carried the last write
    pub version: u64,
    /// Every write, oldest first
    pub lineage: Vec<FieldRevision>,
}

/// A pending write produced by a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub key: String,
    pub value: Value,
    pub owner: Stage,
}

impl FieldWrite {
    pub fn new(key: impl Into<String>, value: Value, owner: Stage) -> Self {
        Self {
            key: key.into(),
            value,
            owner,
        }
    }
}

/// Accumulated session data keyed by dotted field names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState {
    fields: BTreeMap<String, FieldEntry>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).map(|entry| &entry.value)
    }

    pub fn entry(&self, key: &str) -> Option<&FieldEntry> {
        self.fields.get(key)
    }

    /// Present and not null
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| !value.is_null())
    }

    /// Required keys that are absent or null, in the order given
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required.iter().filter(|key| !self.has(key)).cloned().collect()
    }

    /// Apply writes committed at `version`
    pub fn apply(&mut self, writes: &[FieldWrite], version: u64) {
        for write in writes {
            let revision = FieldRevision {
                version,
                owner: write.owner,
            };
            match self.fields.get_mut(&write.key) {
                Some(entry) => {
                    entry.value = write.value.clone();
                    entry.owner = write.owner;
                    entry.version = version;
                    entry.lineage.push(revision);
                }
                None => {
                    self.fields.insert(
                        write.key.clone(),
                        FieldEntry {
                            value: write.value.clone(),
                            owner: write.owner,
                            version,
                            lineage: vec![revision],
                        },
                    );
                }
            }
        }
    }

    /// Every field as a flat key/value map
    pub fn view(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Fields visible to agents and users (reserved keys omitted)
    pub fn public_view(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Public fields last written by `stage`
    pub fn owned_by(&self, stage: Stage) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(key, entry)| entry.owner == stage && !is_reserved_key(key))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
