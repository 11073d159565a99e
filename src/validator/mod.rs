//! Command validation.
//!
//! A candidate command is judged against the step that produced it:
//! 1. forbidden safety patterns (skipped only under an explicit per-task bypass)
//! 2. the step's bound target, when it has one
//! 3. enumerated intent/tool mismatches
//! 4. tool diversity over the immediately preceding steps
//!
//! Checks short-circuit on the first failure. [`evaluate`] is the pure
//! decision; [`CommandValidator`] wraps it with the diversity tracker and the
//! audit sink so every decision is recorded exactly once.

mod diversity;
mod safety;
mod taxonomy;

pub use diversity::{DiversityTracker, ToolUse};
pub use safety::SafetyPolicy;
pub use taxonomy::{
    classify_intent, classify_tool, family_of, find_mismatch, leading_executable, mentions,
    names_tool, step_requires_target, Intent, MismatchRule, ToolFamily,
};

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditSink, Decision};
use crate::task::TaskId;

/// Why a command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionKind {
    Safety,
    Mismatch,
    Diversity,
    EmptyCommand,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::Safety => "safety",
            RejectionKind::Mismatch => "mismatch",
            RejectionKind::Diversity => "diversity",
            RejectionKind::EmptyCommand => "empty-command",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    /// "accepted", "bypass", or the rejection kind
    pub reason: String,
    /// Human-readable explanation or directive for the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<ToolFamily>,
}

impl Verdict {
    fn accept(reason: &str, intent: Intent, family: ToolFamily) -> Self {
        Self {
            accepted: true,
            reason: reason.to_string(),
            detail: None,
            rejection: None,
            intent,
            family: Some(family),
        }
    }

    fn reject(kind: RejectionKind, detail: String, intent: Intent, family: Option<ToolFamily>) -> Self {
        Self {
            accepted: false,
            reason: kind.as_str().to_string(),
            detail: Some(detail),
            rejection: Some(kind),
            intent,
            family,
        }
    }

    pub fn is_safety_rejection(&self) -> bool {
        self.rejection == Some(RejectionKind::Safety)
    }

    /// Reason plus detail, as fed back into the next command request.
    pub fn explanation(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}: {}", self.reason, detail),
            None => self.reason.clone(),
        }
    }
}

/// Pure validation of `command` for a step.
///
/// `preceding` holds the tool family accepted for each of the immediately
/// preceding steps (oldest first), at most `window` entries.
pub fn evaluate(
    safety: &SafetyPolicy,
    window: usize,
    step_description: &str,
    command: &str,
    preceding: &[ToolFamily],
    target: Option<&str>,
    bypass: bool,
) -> Verdict {
    let intent = classify_intent(step_description);
    let command = command.trim();

    // A blank command cannot run, bypass or not
    let Some(family) = classify_tool(command) else {
        return Verdict::reject(
            RejectionKind::EmptyCommand,
            "no command was produced".to_string(),
            intent,
            None,
        );
    };

    // The operator's target choice holds even under bypass
    if let Some(target) = target {
        if let Some(why) = target_mismatch(command, target) {
            return Verdict::reject(RejectionKind::Mismatch, why, intent, Some(family));
        }
    }

    if bypass {
        return Verdict::accept("bypass", intent, family);
    }

    if let Some(pattern) = safety.check(command) {
        return Verdict::reject(
            RejectionKind::Safety,
            format!("matches forbidden pattern: {}", pattern),
            intent,
            Some(family),
        );
    }

    if let Some((_, why)) = find_mismatch(step_description, intent, command, family) {
        return Verdict::reject(RejectionKind::Mismatch, why, intent, Some(family));
    }

    let repeated = window > 0
        && family != ToolFamily::Other
        && preceding.len() >= window
        && preceding[preceding.len() - window..].iter().all(|f| *f == family);
    if repeated && !names_tool(step_description, family) {
        let alternatives: Vec<&str> = intent
            .accepted_families()
            .iter()
            .filter(|f| **f != family)
            .map(|f| f.as_str())
            .collect();
        return Verdict::reject(
            RejectionKind::Diversity,
            format!(
                "{} was used for the previous {} steps; use a different tool family: {}",
                family,
                window,
                alternatives.join(", ")
            ),
            intent,
            Some(family),
        );
    }

    Verdict::accept("accepted", intent, family)
}

/// Why `command` does not address the bound `target`, if it does not.
///
/// A command for a bound step must name the target and no other IPv4 address.
pub fn target_mismatch(command: &str, target: &str) -> Option<String> {
    let addresses: Vec<&str> = ipv4_re().find_iter(command).map(|m| m.as_str()).collect();
    if let Some(other) = addresses.iter().find(|a| **a != target) {
        return Some(format!(
            "command addresses {} but this step's target is {}",
            other, target
        ));
    }
    if addresses.is_empty() && !names_host(command, target) {
        return Some(format!("command does not address this step's target {}", target));
    }
    None
}

fn names_host(command: &str, host: &str) -> bool {
    let is_host_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.';
    command.match_indices(host).any(|(i, _)| {
        let before = command[..i].chars().next_back();
        let after = command[i + host.len()..].chars().next();
        !before.is_some_and(is_host_char) && !after.is_some_and(is_host_char)
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid ipv4 regex"))
}

/// Stateful validator shared by all tasks.
pub struct CommandValidator {
    safety: SafetyPolicy,
    tracker: Arc<DiversityTracker>,
    audit: Arc<dyn AuditSink>,
    window: usize,
}

impl CommandValidator {
    pub fn new(
        safety: SafetyPolicy,
        tracker: Arc<DiversityTracker>,
        audit: Arc<dyn AuditSink>,
        window: usize,
    ) -> Self {
        Self {
            safety,
            tracker,
            audit,
            window,
        }
    }

    pub fn tracker(&self) -> &Arc<DiversityTracker> {
        &self.tracker
    }

    /// Validate, record the decision in the tracker and emit one audit event.
    pub fn validate(
        &self,
        task_id: TaskId,
        step: u32,
        step_description: &str,
        command: &str,
        target: Option<&str>,
        bypass: bool,
    ) -> Verdict {
        let preceding = self.tracker.preceding_steps(task_id, step, self.window);
        let verdict = evaluate(
            &self.safety,
            self.window,
            step_description,
            command,
            &preceding,
            target,
            bypass,
        );

        if let Some(family) = verdict.family {
            self.tracker.record(task_id, step, family, verdict.accepted);
        }

        self.audit.record(AuditEvent {
            timestamp: Utc::now(),
            task_id,
            step,
            command: command.to_string(),
            intent: verdict.intent.as_str().to_string(),
            family: verdict.family.map(|f| f.as_str().to_string()),
            decision: if verdict.accepted {
                Decision::Accepted
            } else {
                Decision::Rejected
            },
            reason: verdict.reason.clone(),
            detail: verdict.detail.clone(),
            bypass,
        });

        verdict
    }
}
