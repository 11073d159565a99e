//! Durable pause state for human target selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use crate::target::{Candidate, DiscoveredHost};

/// Output of a finished step carried across a pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: u32,
    pub command: Option<String>,
    pub output: String,
}

/// Everything the engine had accumulated when it paused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Rendered planning context the steps were generated from
    pub planning_context: String,
    /// Hosts known at pause time
    pub hosts: Vec<DiscoveredHost>,
    /// Results of steps that finished before the pause
    pub outcomes: Vec<StepOutcome>,
}

/// Written when target confidence falls below the threshold.
///
/// # Invariants
/// - Consumed at most once; `consumed_at` is set by the consuming resume
/// - `resume_from_step` is the step that needed the target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub task_id: TaskId,
    pub resume_from_step: u32,
    /// Filled in by resume with the operator's choice
    pub selected_target: Option<String>,
    pub context_snapshot: ContextSnapshot,
    /// Candidates surfaced for manual selection
    pub candidates: Vec<Candidate>,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ExecutionCheckpoint {
    pub fn new(
        task_id: TaskId,
        resume_from_step: u32,
        context_snapshot: ContextSnapshot,
        candidates: Vec<Candidate>,
        confidence: u8,
    ) -> Self {
        Self {
            task_id,
            resume_from_step,
            selected_target: None,
            context_snapshot,
            candidates,
            confidence,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}
