//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId, TaskStatus};

/// Request to start a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Free-form objective, e.g. "Assess the Hikvision camera over rtsp"
    pub objective: String,

    /// Skip safety and tool checks for this task
    #[serde(default)]
    pub bypass: bool,
}

/// Response after creating a task.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// Operator's answer to a `target_selection_required` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    /// Address (or hostname) of the real target
    pub selected_ip: String,

    /// Step to continue at; defaults to the step that paused
    #[serde(default)]
    pub resume_from_step: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeResponse {
    pub id: TaskId,
    pub resume_from_step: u32,
    pub status: TaskStatus,
}

/// Compact task listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub objective: String,
    pub status: TaskStatus,
    pub bypass: bool,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id(),
            objective: task.objective().to_string(),
            status: task.status().clone(),
            bypass: task.bypass(),
            steps: task.steps().len(),
            bound_target: task.bound_target().map(str::to_string),
            created_at: task.created_at(),
            updated_at: task.updated_at(),
        }
    }
}

/// Query for the live event stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    /// Only stream this task, replaying its history first
    pub task_id: Option<TaskId>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Model used for planning
    pub model: String,

    /// Tasks currently known to the engine
    pub tasks: usize,

    /// Minimum confidence for autonomous target binding
    pub confidence_threshold: u8,
}
