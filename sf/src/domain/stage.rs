//! Workflow stages and the allowed transitions between them

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Position of a session in the planning flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Collecting the couple's profile
    Onboarding,
    /// Region, culture, guest count and style
    Preferences,
    /// Total budget and allocations
    Budget,
    /// Vendor search and shortlisting
    Vendor,
    /// Handling an off-stage question before resuming
    IdleInterrupt,
    Completed,
    Failed,
    /// Handed off to a human operator
    Escalated,
}

impl Stage {
    /// Stages that own a reasoning agent, in flow order
    pub const DOMAIN: [Stage; 4] = [Stage::Onboarding, Stage::Preferences, Stage::Budget, Stage::Vendor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Onboarding => "ONBOARDING",
            Stage::Preferences => "PREFERENCES",
            Stage::Budget => "BUDGET",
            Stage::Vendor => "VENDOR",
            Stage::IdleInterrupt => "IDLE_INTERRUPT",
            Stage::Completed => "COMPLETED",
            Stage::Failed => "FAILED",
            Stage::Escalated => "ESCALATED",
        }
    }

    /// No transitions leave a terminal stage
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Escalated)
    }

    pub fn is_domain(&self) -> bool {
        Self::DOMAIN.contains(self)
    }

    /// Next stage in the main progression
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Onboarding => Some(Stage::Preferences),
            Stage::Preferences => Some(Stage::Budget),
            Stage::Budget => Some(Stage::Vendor),
            Stage::Vendor => Some(Stage::Completed),
            _ => None,
        }
    }

    /// Whether a committed transition from `self` to `to` is legal
    ///
    /// Staying put is legal for live stages (writes without a stage change).
    pub fn can_transition_to(&self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == to || matches!(to, Stage::Failed | Stage::Escalated) {
            return true;
        }
        match self {
            Stage::IdleInterrupt => to.is_domain(),
            domain => to == Stage::IdleInterrupt || domain.next() == Some(to),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ONBOARDING" => Ok(Stage::Onboarding),
            "PREFERENCES" => Ok(Stage::Preferences),
            "BUDGET" => Ok(Stage::Budget),
            "VENDOR" => Ok(Stage::Vendor),
            "IDLE_INTERRUPT" => Ok(Stage::IdleInterrupt),
            "COMPLETED" => Ok(Stage::Completed),
            "FAILED" => Ok(Stage::Failed),
            "ESCALATED" => Ok(Stage::Escalated),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}
