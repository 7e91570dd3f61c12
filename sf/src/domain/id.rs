//! Identifier derivation
//!
//! Instance ids are derived from session identity so every caller resolves the
//! same session to the same instance. Task ids double as idempotency keys.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex SHA-256 of the canonical JSON encoding of `value`
pub fn digest_json(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex_digest(&bytes)
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable instance id for a user's planning session
pub fn instance_id_for_session(user_id: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(session_id.as_bytes());
    let digest = hex_digest(&hasher.finalize());
    format!("sess-{}", &digest[..16])
}

/// Turn id for work dispatched at `version`
pub fn turn_id(instance_id: &str, generation: u32, version: u64) -> String {
    format!("{instance_id}:g{generation}:v{version}")
}

/// Task id of one branch of a turn
pub fn task_id(turn_id: &str, branch: usize) -> String {
    format!("{turn_id}:{branch}")
}

/// Idempotency key of a stage exit branch
///
/// Independent of the version so a re-dispatched exit reuses the key of the
/// attempt whose acknowledgement was lost.
pub fn exit_key(instance_id: &str, generation: u32, stage: &str, branch: usize) -> String {
    format!("{instance_id}:g{generation}:{stage}:exit:{branch}")
}

/// Fresh lease token
pub fn lease_token() -> String {
    Uuid::now_v7().to_string()
}

/// Default worker identity for lease ownership
pub fn worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), Uuid::now_v7().simple())
}
