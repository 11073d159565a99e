//! Ordered engine event stream.
//!
//! Each task keeps an append-only history; every event is also fanned out on
//! a global broadcast channel. Appending and broadcasting happen under the
//! history lock, so subscribers see a task's events in `seq` order.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::exec::FailureCategory;
use crate::target::Candidate;
use crate::task::{FailureKind, TaskId};

/// Step as announced by `steps_generated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStepInfo {
    pub number: u32,
    pub description: String,
    pub requires_target: bool,
}

/// Event payloads, one per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    StepsGenerated {
        steps: Vec<PlannedStepInfo>,
    },
    StepStart {
        description: String,
    },
    StepAttempt {
        attempt: u32,
        command: String,
    },
    StepRetry {
        attempt: u32,
        kind: FailureKind,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<FailureCategory>,
    },
    StepSuccess {
        attempt: u32,
        command: String,
        exit_status: Option<i32>,
        output: String,
    },
    StepFailed {
        attempts: u32,
        kind: FailureKind,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<FailureCategory>,
    },
    StepBlocked {
        command: String,
        reason: String,
    },
    TargetSelectionRequired {
        candidates: Vec<Candidate>,
        confidence: u8,
        resume_from_step: u32,
    },
    TargetConfirmed {
        target: String,
        /// Resolver confidence; absent for an operator's choice
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<u8>,
        manual: bool,
    },
    TaskResumed {
        resume_from_step: u32,
    },
    TaskFailed {
        reason: String,
    },
    StepsCompleted {
        completed: usize,
        failed: usize,
        blocked: usize,
    },
}

impl EventKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::StepsGenerated { .. } => "steps_generated",
            EventKind::StepStart { .. } => "step_start",
            EventKind::StepAttempt { .. } => "step_attempt",
            EventKind::StepRetry { .. } => "step_retry",
            EventKind::StepSuccess { .. } => "step_success",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::StepBlocked { .. } => "step_blocked",
            EventKind::TargetSelectionRequired { .. } => "target_selection_required",
            EventKind::TargetConfirmed { .. } => "target_confirmed",
            EventKind::TaskResumed { .. } => "task_resumed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::StepsCompleted { .. } => "steps_completed",
        }
    }

    /// Last event a step emits.
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::StepSuccess { .. } | EventKind::StepFailed { .. } | EventKind::StepBlocked { .. }
        )
    }
}

/// One entry of a task's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// 1-based position within the task's stream
    pub seq: u64,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn event_name(&self) -> &'static str {
        self.kind.event_name()
    }
}

/// Append-only history of one task.
#[derive(Debug)]
pub(crate) struct EventLog {
    task_id: TaskId,
    history: Mutex<Vec<EngineEvent>>,
    tx: broadcast::Sender<EngineEvent>,
}

impl EventLog {
    pub(crate) fn new(task_id: TaskId, tx: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            task_id,
            history: Mutex::new(Vec::new()),
            tx,
        }
    }

    pub(crate) fn emit(&self, step_number: Option<u32>, kind: EventKind) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let event = EngineEvent {
            seq: history.len() as u64 + 1,
            task_id: self.task_id,
            step_number,
            timestamp: Utc::now(),
            kind,
        };
        tracing::debug!(
            task_id = %self.task_id,
            step = ?step_number,
            seq = event.seq,
            "event {}",
            event.event_name()
        );
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
        history.push(event);
    }

    pub(crate) fn snapshot(&self) -> Vec<EngineEvent> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let (tx, _rx) = broadcast::channel(8);
        let log = EventLog::new(TaskId::new(), tx);
        log.emit(
            Some(2),
            EventKind::StepAttempt {
                attempt: 1,
                command: "nmap -sn 10.0.0.0/24".to_string(),
            },
        );
        log.emit(None, EventKind::TaskFailed { reason: "cancelled".to_string() });

        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 2);

        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["type"], "step_attempt");
        assert_eq!(json["step_number"], 2);
        assert_eq!(json["payload"]["command"], "nmap -sn 10.0.0.0/24");

        let json = serde_json::to_value(&events[1]).unwrap();
        assert!(json.get("step_number").is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_history_order() {
        let (tx, mut rx) = broadcast::channel(8);
        let log = EventLog::new(TaskId::new(), tx);
        log.emit(Some(1), EventKind::StepStart { description: "a".to_string() });
        log.emit(Some(1), EventKind::StepBlocked { command: "x".to_string(), reason: "safety".to_string() });
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
        assert!(second.kind.is_step_terminal());
    }
}
