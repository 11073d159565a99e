//! Task module - tasks, their planned steps and the pause checkpoint.
//!
//! All types are plain data with explicit, validated state transitions:
//! - Invariants are documented and enforced by the transition methods
//! - Nothing here performs IO; the engine persists and drives tasks

mod checkpoint;
mod step;
#[allow(clippy::module_inception)]
mod task;

pub use checkpoint::{ContextSnapshot, ExecutionCheckpoint, StepOutcome};
pub use step::{FailureKind, Step, StepError, StepStatus};
pub use task::{Task, TaskError, TaskId, TaskStatus};
