//! Retry policies and back-off

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::ActivityKind;

/// Back-off and attempt limits for one activity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Total attempts including the first
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Per-attempt timeout
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Randomize each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 4,
            timeout_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `attempt` failed attempts: base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay to wait after `attempt` failed attempts
    ///
    /// With jitter the result lies in `[backoff/2, backoff]`. A collaborator
    /// supplied `retry_after` is a floor.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let ceiling = self.backoff(attempt);
        let delay = if self.jitter && ceiling.as_millis() > 1 {
            let ceiling_ms = ceiling.as_millis() as u64;
            let half = ceiling_ms / 2;
            Duration::from_millis(half + rand::rng().random_range(0..=ceiling_ms - half))
        } else {
            ceiling
        };
        match retry_after {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry policies per activity kind; unset kinds use `default`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryPolicy,

    #[serde(rename = "agent-call")]
    pub agent_call: Option<RetryPolicy>,

    #[serde(rename = "data-query")]
    pub data_query: Option<RetryPolicy>,

    #[serde(rename = "data-write")]
    pub data_write: Option<RetryPolicy>,

    pub notify: Option<RetryPolicy>,

    pub search: Option<RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicy::default(),
            agent_call: Some(RetryPolicy {
                timeout_ms: 60_000,
                ..RetryPolicy::default()
            }),
            data_query: None,
            data_write: None,
            notify: None,
            search: Some(RetryPolicy {
                timeout_ms: 10_000,
                ..RetryPolicy::default()
            }),
        }
    }
}

impl RetryConfig {
    pub fn policy_for(&self, kind: ActivityKind) -> &RetryPolicy {
        let specific = match kind {
            ActivityKind::AgentCall => &self.agent_call,
            ActivityKind::DataQuery => &self.data_query,
            ActivityKind::DataWrite => &self.data_write,
            ActivityKind::Notify => &self.notify,
            ActivityKind::Search => &self.search,
        };
        specific.as_ref().unwrap_or(&self.default)
    }
}
