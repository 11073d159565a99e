//! Security audit trail for validator decisions.
//!
//! Every accept/reject decision, bypassed or not, produces exactly one
//! [`AuditEvent`]. Sinks are fire-and-forget: `record` never blocks and never
//! fails the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::task::TaskId;

/// Outcome recorded for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub step: u32,
    pub command: String,
    pub intent: String,
    pub family: Option<String>,
    pub decision: Decision,
    /// Short reason: "accepted", "bypass", "safety", "mismatch", "diversity" or "empty-command"
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Set when the task runs with the safety bypass enabled
    pub bypass: bool,
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default, Clone)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        match event.decision {
            Decision::Accepted if event.bypass => tracing::warn!(
                target: "audit",
                task_id = %event.task_id,
                step = event.step,
                family = event.family.as_deref().unwrap_or("-"),
                reason = %event.reason,
                bypass = true,
                command = %event.command,
                "command accepted under bypass"
            ),
            Decision::Accepted => tracing::info!(
                target: "audit",
                task_id = %event.task_id,
                step = event.step,
                family = event.family.as_deref().unwrap_or("-"),
                command = %event.command,
                "command accepted"
            ),
            Decision::Rejected => tracing::warn!(
                target: "audit",
                task_id = %event.task_id,
                step = event.step,
                family = event.family.as_deref().unwrap_or("-"),
                reason = %event.reason,
                detail = event.detail.as_deref().unwrap_or(""),
                command = %event.command,
                "command rejected"
            ),
        }
    }
}

/// Forwards audit events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAudit {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAudit {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAudit {
    fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Audit receiver dropped; event discarded");
        }
    }
}
