//! Planned steps and their per-step state machine.
//!
//! # State Machine
//! ```text
//! Pending -> Running -> Completed
//!               |  \-> Blocked
//!               |  \-> Failed
//!               \-> Retrying -> Running
//! ```
//!
//! # Invariants
//! - `number` is 1-based and never changes
//! - `attempts <= max_attempts` for every step the engine drives
//! - `bound_target` is set at most once

use serde::{Deserialize, Serialize};

use super::TaskError;
use crate::exec::FailureCategory;

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Blocked,
}

impl StepStatus {
    /// Terminal for the step loop: no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Blocked
        )
    }
}

/// Which bounded loop produced the last error of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The validator rejected the candidate command
    Validation,
    /// The command ran and failed, timed out or could not be run
    Execution,
    /// No command could be obtained from the planner
    Planner,
}

/// Last error recorded on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub reason: String,
    /// Cause of an execution failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
}

impl StepError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = Some(category);
        self
    }
}

/// One planned action within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    number: u32,
    description: String,
    /// Substring in stdout that marks success regardless of exit status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expect: Option<String>,
    status: StepStatus,
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    requires_target: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bound_target: Option<String>,
}

impl Step {
    /// Create a pending step.
    ///
    /// # Preconditions
    /// - `number >= 1`
    /// - `description` is non-empty
    pub fn new(
        number: u32,
        description: impl Into<String>,
        expect: Option<String>,
        requires_target: bool,
    ) -> Result<Self, TaskError> {
        let description = description.into();
        if number == 0 {
            return Err(TaskError::InvalidStepNumber(number));
        }
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }
        Ok(Self {
            number,
            description,
            expect: expect.filter(|e| !e.trim().is_empty()),
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            last_command: None,
            result: None,
            requires_target,
            bound_target: None,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn expect(&self) -> Option<&str> {
        self.expect.as_deref()
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&StepError> {
        self.last_error.as_ref()
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn requires_target(&self) -> bool {
        self.requires_target
    }

    pub fn bound_target(&self) -> Option<&str> {
        self.bound_target.as_deref()
    }

    /// Bind the step to a target.
    ///
    /// # Errors
    /// Returns `Err` if a different target is already bound.
    pub fn bind_target(&mut self, target: &str) -> Result<(), TaskError> {
        match &self.bound_target {
            Some(existing) if existing == target => Ok(()),
            Some(existing) => Err(TaskError::TargetAlreadyBound {
                step: self.number,
                target: existing.clone(),
            }),
            None => {
                self.bound_target = Some(target.to_string());
                Ok(())
            }
        }
    }

    /// Begin a new attempt.
    ///
    /// # Precondition
    /// `status` is Pending or Retrying, and `attempts < max_attempts`.
    ///
    /// # Postcondition
    /// `status == Running` and `attempts` is incremented by one.
    pub fn begin_attempt(&mut self, max_attempts: u32) -> Result<u32, TaskError> {
        match self.status {
            StepStatus::Pending | StepStatus::Retrying => {}
            other => {
                return Err(TaskError::InvalidTransition {
                    from: format!("{:?}", other),
                    to: "Running".to_string(),
                })
            }
        }
        if self.attempts >= max_attempts {
            return Err(TaskError::AttemptsExhausted {
                step: self.number,
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        self.status = StepStatus::Running;
        Ok(self.attempts)
    }

    pub fn set_last_command(&mut self, command: &str) {
        self.last_command = Some(command.to_string());
    }

    /// Record a recoverable failure of the current attempt.
    ///
    /// # Precondition
    /// `status == Running`
    pub fn retry(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<(), TaskError> {
        self.retry_with(StepError::new(kind, reason))
    }

    pub fn retry_with(&mut self, error: StepError) -> Result<(), TaskError> {
        self.transition_from_running(StepStatus::Retrying)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// # Precondition
    /// `status == Running`
    pub fn complete(&mut self, result: String) -> Result<(), TaskError> {
        self.transition_from_running(StepStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Mark the step failed after its attempts ran out.
    ///
    /// # Precondition
    /// `status` is Running or Retrying
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<(), TaskError> {
        self.fail_with(StepError::new(kind, reason))
    }

    pub fn fail_with(&mut self, error: StepError) -> Result<(), TaskError> {
        match self.status {
            StepStatus::Running | StepStatus::Retrying => {
                self.status = StepStatus::Failed;
                self.last_error = Some(error);
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: format!("{:?}", other),
                to: "Failed".to_string(),
            }),
        }
    }

    /// Permanently block the step after a safety rejection.
    ///
    /// # Precondition
    /// `status == Running`
    pub fn block(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.transition_from_running(StepStatus::Blocked)?;
        self.last_error = Some(StepError::new(FailureKind::Validation, reason));
        Ok(())
    }

    /// Put an interrupted attempt back so it can be driven again.
    ///
    /// Used when a task pauses or is reloaded mid-step; the attempt counter is
    /// left untouched so the bound still holds.
    pub fn reset_for_resume(&mut self) {
        if matches!(self.status, StepStatus::Running) {
            self.status = if self.attempts == 0 {
                StepStatus::Pending
            } else {
                StepStatus::Retrying
            };
        }
    }

    fn transition_from_running(&mut self, to: StepStatus) -> Result<(), TaskError> {
        if self.status != StepStatus::Running {
            return Err(TaskError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", to),
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_are_bounded() {
        let mut step = Step::new(1, "scan the network", None, false).unwrap();
        for _ in 0..3 {
            step.begin_attempt(3).unwrap();
            step.retry(FailureKind::Execution, "exit 1").unwrap();
        }
        assert_eq!(step.attempts(), 3);
        assert!(matches!(
            step.begin_attempt(3),
            Err(TaskError::AttemptsExhausted { step: 1, attempts: 3 })
        ));
        step.fail(FailureKind::Execution, "exit 1").unwrap();
        assert_eq!(step.status(), StepStatus::Failed);
    }

    #[test]
    fn test_block_is_terminal() {
        let mut step = Step::new(2, "read the config", None, true).unwrap();
        step.begin_attempt(3).unwrap();
        step.block("safety").unwrap();
        assert!(step.status().is_terminal());
        assert!(step.begin_attempt(3).is_err());
        assert_eq!(step.last_error().unwrap().kind, FailureKind::Validation);
    }

    #[test]
    fn test_bound_target_is_set_once() {
        let mut step = Step::new(1, "connect over adb", None, true).unwrap();
        step.bind_target("10.0.0.5").unwrap();
        step.bind_target("10.0.0.5").unwrap();
        assert!(step.bind_target("10.0.0.6").is_err());
        assert_eq!(step.bound_target(), Some("10.0.0.5"));
    }

    #[test]
    fn test_rejects_zero_number() {
        assert!(Step::new(0, "x", None, false).is_err());
        assert!(Step::new(1, "  ", None, false).is_err());
    }

    #[test]
    fn test_fail_outside_an_attempt_is_reported() {
        let mut step = Step::new(1, "check rtsp", None, true).unwrap();
        assert!(matches!(
            step.fail(FailureKind::Execution, "cancelled"),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert_eq!(step.status(), StepStatus::Pending);

        step.begin_attempt(3).unwrap();
        let error = StepError::new(FailureKind::Execution, "exit code 7").with_category(FailureCategory::Unreachable);
        step.fail_with(error).unwrap();
        assert_eq!(step.last_error().unwrap().category, Some(FailureCategory::Unreachable));
    }

    #[test]
    fn test_reset_for_resume_keeps_attempts() {
        let mut step = Step::new(1, "check rtsp", None, true).unwrap();
        step.begin_attempt(3).unwrap();
        step.reset_for_resume();
        assert_eq!(step.status(), StepStatus::Retrying);
        assert_eq!(step.attempts(), 1);
    }
}
