//! Turns: the unit of work between two committed transitions

use serde::{Deserialize, Serialize};

use super::activity::ActivityTask;
use super::stage::Stage;
use super::state::FieldWrite;

/// Why a turn was dispatched, which decides how it closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnKind {
    /// Stage agent handles a signal
    StageWork,
    /// Load the stored profile before onboarding asks anything
    Prefetch,
    /// Vendor search fan-out ahead of the vendor agent
    VendorSearch,
    /// Off-stage question answered from IDLE_INTERRUPT; closes back to `resume`
    Interrupt { resume: Stage },
    /// Exit action of a finished stage; closes by advancing to `next`
    StageExit { next: Stage },
}

/// Tasks dispatched together and fanned in at one barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPlan {
    pub turn_id: String,
    pub kind: TurnKind,
    /// Stage the turn works on behalf of
    pub stage: Stage,
    /// Signal acknowledged when the turn commits successfully
    #[serde(default)]
    pub signal_id: Option<String>,
    pub tasks: Vec<ActivityTask>,
    /// Fixed writes applied together with the task outputs
    #[serde(default)]
    pub writes: Vec<FieldWrite>,
    pub dispatched_at: i64,
}

impl TurnPlan {
    pub fn task(&self, task_id: &str) -> Option<&ActivityTask> {
        self.tasks.iter().find(|task| task.task_id == task_id)
    }
}
