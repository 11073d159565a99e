//! Core Task type: one objective driven through the engine.
//!
//! # Invariants
//! - Step numbers are contiguous from 1 and never renumbered
//! - At most one unconsumed checkpoint exists, and only while paused
//! - `bound_target` is set at most once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::{ContextSnapshot, ExecutionCheckpoint, StepOutcome};
use super::step::Step;
use crate::target::{merge_hosts, DiscoveredHost, TargetHints};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Running -> Completed
///         \-> Failed
///         \-> PausedForTarget -> Running
///                            \-> Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planning or executing steps
    Running,
    /// Waiting for an operator to pick the target
    PausedForTarget,
    /// Every step reached a terminal status
    Completed,
    /// Planning failed, the task was cancelled or interrupted
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::PausedForTarget => "paused_for_target",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

/// One end-to-end run of an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    objective: String,
    /// Per-task safety bypass; never ambient
    bypass: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: TaskStatus,
    hints: TargetHints,
    #[serde(default)]
    hosts: Vec<DiscoveredHost>,
    #[serde(default)]
    planning_context: String,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bound_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint: Option<ExecutionCheckpoint>,
}

impl Task {
    /// Create a running task for `objective`.
    ///
    /// # Errors
    /// Returns `Err` if the objective is blank.
    pub fn new(objective: impl Into<String>, bypass: bool) -> Result<Self, TaskError> {
        let objective = objective.into();
        if objective.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }
        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            hints: TargetHints::from_objective(&objective),
            objective,
            bypass,
            created_at: now,
            updated_at: now,
            status: TaskStatus::Running,
            hosts: Vec::new(),
            planning_context: String::new(),
            steps: Vec::new(),
            bound_target: None,
            checkpoint: None,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn bypass(&self) -> bool {
        self.bypass
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn hints(&self) -> &TargetHints {
        &self.hints
    }

    pub fn hosts(&self) -> &[DiscoveredHost] {
        &self.hosts
    }

    pub fn planning_context(&self) -> &str {
        &self.planning_context
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn bound_target(&self) -> Option<&str> {
        self.bound_target.as_deref()
    }

    pub fn checkpoint(&self) -> Option<&ExecutionCheckpoint> {
        self.checkpoint.as_ref()
    }

    /// Checkpoint waiting for a resume, if any.
    pub fn pending_checkpoint(&self) -> Option<&ExecutionCheckpoint> {
        self.checkpoint.as_ref().filter(|c| !c.is_consumed())
    }

    pub fn step(&self, number: u32) -> Option<&Step> {
        self.steps.get(number.checked_sub(1)? as usize)
    }

    pub fn step_mut(&mut self, number: u32) -> Option<&mut Step> {
        self.updated_at = Utc::now();
        self.steps.get_mut(number.checked_sub(1)? as usize)
    }

    /// Install the planned steps.
    ///
    /// # Preconditions
    /// - No steps have been installed yet
    /// - `steps` is non-empty and numbered 1..=n in order
    pub fn set_plan(&mut self, planning_context: String, steps: Vec<Step>) -> Result<(), TaskError> {
        if !self.steps.is_empty() {
            return Err(TaskError::AlreadyPlanned);
        }
        if steps.is_empty() {
            return Err(TaskError::EmptyPlan);
        }
        for (idx, step) in steps.iter().enumerate() {
            if step.number() as usize != idx + 1 {
                return Err(TaskError::InvalidStepNumber(step.number()));
            }
        }
        self.planning_context = planning_context;
        self.steps = steps;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Merge newly discovered hosts. Returns how many were new.
    pub fn merge_hosts(&mut self, hosts: Vec<DiscoveredHost>) -> usize {
        let added = merge_hosts(&mut self.hosts, hosts);
        if added > 0 {
            self.updated_at = Utc::now();
        }
        added
    }

    /// Bind the task-wide target inherited by every later step.
    ///
    /// # Errors
    /// Returns `Err` if a different target is already bound.
    pub fn bind_target(&mut self, target: &str) -> Result<(), TaskError> {
        match &self.bound_target {
            Some(existing) if existing == target => Ok(()),
            Some(existing) => Err(TaskError::TargetAlreadyBound {
                step: 0,
                target: existing.clone(),
            }),
            None => {
                self.bound_target = Some(target.to_string());
                self.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    /// Snapshot of the accumulated context, for a checkpoint.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            planning_context: self.planning_context.clone(),
            hosts: self.hosts.clone(),
            outcomes: self
                .steps
                .iter()
                .filter_map(|s| {
                    s.result().map(|output| StepOutcome {
                        step: s.number(),
                        command: s.last_command().map(str::to_string),
                        output: output.to_string(),
                    })
                })
                .collect(),
        }
    }

    // State transitions - explicit and validated

    /// Pause for human target selection.
    ///
    /// # Precondition
    /// `status == Running` and no unconsumed checkpoint exists.
    pub fn pause_for_target(&mut self, checkpoint: ExecutionCheckpoint) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid("PausedForTarget"));
        }
        if self.pending_checkpoint().is_some() {
            return Err(TaskError::CheckpointOutstanding);
        }
        if let Some(step) = self.step_mut(checkpoint.resume_from_step) {
            step.reset_for_resume();
        }
        self.checkpoint = Some(checkpoint);
        self.status = TaskStatus::PausedForTarget;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Consume the checkpoint with the operator's target.
    ///
    /// # Preconditions
    /// - `status == PausedForTarget` with an unconsumed checkpoint
    /// - `1 <= resume_from_step <= checkpoint.resume_from_step`
    ///
    /// # Postconditions
    /// - `status == Running`, the checkpoint is consumed
    /// - the target is bound to the task and to every step from `resume_from_step` on
    ///
    /// Returns the step to resume at. Nothing changes on error.
    pub fn resume(&mut self, target: &str, resume_from_step: Option<u32>) -> Result<u32, TaskError> {
        let paused_at = match &self.checkpoint {
            Some(c) if c.is_consumed() => return Err(TaskError::CheckpointConsumed),
            Some(c) => c.resume_from_step,
            None => return Err(TaskError::NoCheckpoint),
        };
        if self.status != TaskStatus::PausedForTarget {
            return Err(self.invalid("Running"));
        }

        let from = resume_from_step.unwrap_or(paused_at);
        if from == 0 || from > paused_at {
            return Err(TaskError::InvalidResumeStep {
                requested: from,
                max: paused_at,
            });
        }
        if let Some(existing) = &self.bound_target {
            if existing != target {
                return Err(TaskError::TargetAlreadyBound {
                    step: from,
                    target: existing.clone(),
                });
            }
        }

        // Steps between `from` and the paused step are re-driven from scratch
        for step in self.steps.iter_mut().skip(from as usize - 1) {
            if step.number() < paused_at && step.status().is_terminal() {
                let fresh = Step::new(
                    step.number(),
                    step.description().to_string(),
                    step.expect().map(str::to_string),
                    step.requires_target(),
                )?;
                *step = fresh;
            }
            if step.requires_target() && step.bound_target().is_none() {
                step.bind_target(target)?;
            }
        }

        self.bound_target = Some(target.to_string());
        if let Some(cp) = self.checkpoint.as_mut() {
            cp.selected_target = Some(target.to_string());
            cp.consumed_at = Some(Utc::now());
        }
        self.status = TaskStatus::Running;
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// # Precondition
    /// `status == Running`
    pub fn complete(&mut self) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Completed;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("Completed")),
        }
    }

    /// Fail the task. An unconsumed checkpoint is discarded.
    ///
    /// # Precondition
    /// `status` is Running or PausedForTarget
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running | TaskStatus::PausedForTarget => {
                if self.pending_checkpoint().is_some() {
                    self.checkpoint = None;
                }
                self.status = TaskStatus::Failed {
                    reason: reason.into(),
                };
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("Failed")),
        }
    }

    fn invalid(&self, to: &str) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status.label().to_string(),
            to: to.to_string(),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Description cannot be empty")]
    EmptyDescription,

    #[error("Invalid step number {0}")]
    InvalidStepNumber(u32),

    #[error("Plan contains no steps")]
    EmptyPlan,

    #[error("Task already has a plan")]
    AlreadyPlanned,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Step {step} exhausted its {attempts} attempts")]
    AttemptsExhausted { step: u32, attempts: u32 },

    #[error("Target already bound to {target} (step {step})")]
    TargetAlreadyBound { step: u32, target: String },

    #[error("An unconsumed checkpoint is already outstanding")]
    CheckpointOutstanding,

    #[error("Checkpoint already consumed")]
    CheckpointConsumed,

    #[error("Task has no checkpoint")]
    NoCheckpoint,

    #[error("Cannot resume from step {requested}; valid range is 1..={max}")]
    InvalidResumeStep { requested: u32, max: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned_task() -> Task {
        let mut task = Task::new("assess the camera", false).unwrap();
        let steps = vec![
            Step::new(1, "discover hosts on the local network", None, false).unwrap(),
            Step::new(2, "enumerate open services on the camera", None, true).unwrap(),
            Step::new(3, "retrieve the rtsp stream description", None, true).unwrap(),
        ];
        task.set_plan("ctx".to_string(), steps).unwrap();
        task
    }

    fn checkpoint_for(task: &Task, step: u32) -> ExecutionCheckpoint {
        ExecutionCheckpoint::new(task.id(), step, task.snapshot(), Vec::new(), 5)
    }

    #[test]
    fn test_plan_must_be_contiguous() {
        let mut task = Task::new("x", false).unwrap();
        let steps = vec![
            Step::new(1, "a", None, false).unwrap(),
            Step::new(3, "b", None, false).unwrap(),
        ];
        assert_eq!(task.set_plan(String::new(), steps), Err(TaskError::InvalidStepNumber(3)));
        assert_eq!(task.set_plan(String::new(), Vec::new()), Err(TaskError::EmptyPlan));
    }

    #[test]
    fn test_pause_and_resume_binds_later_steps() {
        let mut task = planned_task();
        let cp = checkpoint_for(&task, 2);
        task.pause_for_target(cp).unwrap();
        assert_eq!(task.status(), &TaskStatus::PausedForTarget);

        let from = task.resume("10.0.0.7", None).unwrap();
        assert_eq!(from, 2);
        assert_eq!(task.status(), &TaskStatus::Running);
        assert_eq!(task.bound_target(), Some("10.0.0.7"));
        assert_eq!(task.step(2).unwrap().bound_target(), Some("10.0.0.7"));
        assert_eq!(task.step(3).unwrap().bound_target(), Some("10.0.0.7"));
        assert!(task.step(1).unwrap().bound_target().is_none());
        assert!(task.checkpoint().unwrap().is_consumed());
    }

    #[test]
    fn test_resume_twice_is_rejected() {
        let mut task = planned_task();
        let cp = checkpoint_for(&task, 2);
        task.pause_for_target(cp).unwrap();
        task.resume("10.0.0.7", Some(2)).unwrap();
        assert_eq!(task.resume("10.0.0.7", Some(2)), Err(TaskError::CheckpointConsumed));
    }

    #[test]
    fn test_invalid_resume_step_keeps_checkpoint() {
        let mut task = planned_task();
        let cp = checkpoint_for(&task, 2);
        task.pause_for_target(cp).unwrap();
        assert_eq!(
            task.resume("10.0.0.7", Some(3)),
            Err(TaskError::InvalidResumeStep { requested: 3, max: 2 })
        );
        assert!(task.pending_checkpoint().is_some());
        assert_eq!(task.status(), &TaskStatus::PausedForTarget);
    }

    #[test]
    fn test_fail_while_paused_discards_checkpoint() {
        let mut task = planned_task();
        let cp = checkpoint_for(&task, 2);
        task.pause_for_target(cp).unwrap();
        task.fail("cancelled").unwrap();
        assert!(task.checkpoint().is_none());
        assert!(task.status().is_terminal());
        assert!(task.complete().is_err());
    }

    #[test]
    fn test_resume_without_pause() {
        let mut task = planned_task();
        assert_eq!(task.resume("10.0.0.7", None), Err(TaskError::NoCheckpoint));
    }

    #[test]
    fn test_serializes_status_with_state_tag() {
        let task = planned_task();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"]["state"], "running");
        assert_eq!(json["steps"][1]["status"], "pending");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), task.id());
    }
}
