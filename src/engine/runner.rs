//! Task driver: plans, then walks the steps in order.
//!
//! Per step:
//! 1. resolve the target if the step needs one (may pause the task)
//! 2. obtain a command (the description itself, or the planner)
//! 3. validate; a safety rejection blocks the step for good
//! 4. run; success completes the step, anything else retries until the
//!    attempt budget is spent or the target turns out to be unreachable

use std::sync::Arc;

use crate::exec::{classify_failure, CommandOutput};
use crate::planner::{concrete_command, CommandRequest, PlannerError};
use crate::target::{parse_nmap_hosts, resolve};
use crate::task::{ExecutionCheckpoint, FailureKind, Step, StepError, StepStatus, Task, TaskStatus};
use crate::validator::step_requires_target;

use super::events::{EventKind, PlannedStepInfo};
use super::{EngineInner, TaskHandle};

/// Output kept per step in the context of later command requests.
const RESULT_PREVIEW_CHARS: usize = 600;
/// Output carried by a `step_success` event.
const EVENT_OUTPUT_CHARS: usize = 4_000;

/// How a step ended from the driver's point of view.
enum StepFlow {
    Continue,
    Paused,
    Cancelled,
}

/// Drive a task from `from_step` until it completes, pauses, fails or is
/// cancelled. The caller holds the task's drive lock.
pub(super) async fn drive(inner: Arc<EngineInner>, handle: Arc<TaskHandle>, from_step: u32) {
    let needs_plan = handle.task.lock().await.steps().is_empty();
    if needs_plan && !plan(&inner, &handle).await {
        return;
    }

    let total = handle.task.lock().await.steps().len() as u32;
    for number in from_step..=total {
        if handle.cancel.is_cancelled() {
            fail_task(&inner, &handle, "cancelled").await;
            return;
        }
        match drive_step(&inner, &handle, number).await {
            StepFlow::Continue => {}
            StepFlow::Paused => return,
            StepFlow::Cancelled => {
                fail_task(&inner, &handle, "cancelled").await;
                return;
            }
        }
    }

    finish(&inner, &handle).await;
}

/// Build context and generate the plan. Returns false if the task failed.
async fn plan(inner: &EngineInner, handle: &TaskHandle) -> bool {
    let objective = handle.task.lock().await.objective().to_string();
    // Discovery can run a network sweep, so it must yield to cancellation too
    let context = tokio::select! {
        _ = handle.cancel.cancelled() => {
            fail_task(inner, handle, "cancelled").await;
            return false;
        }
        context = inner.context.build(&objective) => context,
    };

    let planned = tokio::select! {
        _ = handle.cancel.cancelled() => {
            fail_task(inner, handle, "cancelled").await;
            return false;
        }
        result = inner.planner.generate_steps(&context) => result,
    };

    let planned = match planned {
        Ok(planned) => planned,
        Err(e) => {
            tracing::error!("Planning failed: {}", e);
            fail_task(inner, handle, &format!("planning failed: {}", e)).await;
            return false;
        }
    };

    let mut steps = Vec::with_capacity(planned.len());
    for (idx, p) in planned.into_iter().enumerate() {
        let requires_target = step_requires_target(&p.description);
        match Step::new(idx as u32 + 1, p.description, p.expect, requires_target) {
            Ok(step) => steps.push(step),
            Err(e) => {
                fail_task(inner, handle, &format!("planning failed: {}", e)).await;
                return false;
            }
        }
    }

    let mut task = handle.task.lock().await;
    if let Err(e) = task.set_plan(context.render(), steps) {
        drop(task);
        fail_task(inner, handle, &format!("planning failed: {}", e)).await;
        return false;
    }
    task.merge_hosts(context.hosts);
    inner.persist(&task).await;

    let infos = task
        .steps()
        .iter()
        .map(|s| PlannedStepInfo {
            number: s.number(),
            description: s.description().to_string(),
            requires_target: s.requires_target(),
        })
        .collect();
    handle.events.emit(None, EventKind::StepsGenerated { steps: infos });
    tracing::info!(task_id = %task.id(), "Planned {} steps", task.steps().len());
    true
}

/// Bind a target to step `number` if it needs one.
///
/// Inherits the task's target when one is bound; otherwise resolves, binding
/// autonomously only at or above the confidence threshold and pausing below it.
/// Returns false if the task paused.
async fn ensure_target(inner: &EngineInner, handle: &TaskHandle, number: u32) -> bool {
    let mut task = handle.task.lock().await;
    let Some(step) = task.step(number) else {
        return true;
    };
    if !step.requires_target() || step.bound_target().is_some() {
        return true;
    }

    if let Some(target) = task.bound_target().map(str::to_string) {
        if let Some(step) = task.step_mut(number) {
            if let Err(e) = step.bind_target(&target) {
                tracing::warn!("Could not inherit target: {}", e);
            }
        }
        return true;
    }

    let resolution = resolve(task.hints(), task.hosts(), &inner.config.weights);
    let threshold = inner.config.confidence_threshold;

    if let Some(choice) = resolution.autonomous_choice(threshold) {
        let target = choice.ip.clone();
        let bound = task
            .bind_target(&target)
            .and_then(|_| match task.step_mut(number) {
                Some(step) => step.bind_target(&target),
                None => Ok(()),
            });
        if let Err(e) = bound {
            tracing::warn!("Could not bind target: {}", e);
        }
        inner.persist(&task).await;
        tracing::info!(
            task_id = %task.id(),
            step = number,
            confidence = resolution.confidence,
            "Target {} selected autonomously",
            target
        );
        handle.events.emit(
            Some(number),
            EventKind::TargetConfirmed {
                target,
                confidence: Some(resolution.confidence),
                manual: false,
            },
        );
        return true;
    }

    let checkpoint = ExecutionCheckpoint::new(
        task.id(),
        number,
        task.snapshot(),
        resolution.candidates.clone(),
        resolution.confidence,
    );
    if let Err(e) = task.pause_for_target(checkpoint) {
        // Cannot pause, so the step must not run against a guessed target
        tracing::error!("Could not pause for target selection: {}", e);
        drop(task);
        fail_task(inner, handle, &format!("target selection failed: {}", e)).await;
        return false;
    }
    inner.persist(&task).await;
    tracing::info!(
        task_id = %task.id(),
        step = number,
        confidence = resolution.confidence,
        "Paused for target selection ({} candidates)",
        resolution.candidates.len()
    );
    handle.events.emit(
        Some(number),
        EventKind::TargetSelectionRequired {
            candidates: resolution.candidates,
            confidence: resolution.confidence,
            resume_from_step: number,
        },
    );
    handle.publish_status(task.status());
    false
}

/// Planning context plus what earlier steps produced.
fn command_context(task: &Task) -> String {
    let mut out = task.planning_context().to_string();
    let done: Vec<&Step> = task.steps().iter().filter(|s| s.result().is_some()).collect();
    if !done.is_empty() {
        out.push_str("\n## Results So Far\n");
        for step in done {
            let output: String = step
                .result()
                .unwrap_or_default()
                .chars()
                .take(RESULT_PREVIEW_CHARS)
                .collect();
            out.push_str(&format!(
                "- Step {} `{}`:\n{}\n",
                step.number(),
                step.last_command().unwrap_or("-"),
                output.trim_end()
            ));
        }
    }
    out
}

async fn drive_step(inner: &EngineInner, handle: &TaskHandle, number: u32) -> StepFlow {
    {
        let task = handle.task.lock().await;
        match task.step(number) {
            Some(step) if !step.status().is_terminal() => {}
            _ => return StepFlow::Continue,
        }
    }

    if !ensure_target(inner, handle, number).await {
        return if handle.cancel.is_cancelled() {
            StepFlow::Cancelled
        } else {
            StepFlow::Paused
        };
    }

    let (task_id, description, expect, bypass, mut feedback) = {
        let task = handle.task.lock().await;
        let Some(step) = task.step(number) else {
            return StepFlow::Continue;
        };
        handle.events.emit(
            Some(number),
            EventKind::StepStart {
                description: step.description().to_string(),
            },
        );
        (
            task.id(),
            step.description().to_string(),
            step.expect().map(str::to_string),
            task.bypass(),
            step.last_error().map(|e| e.reason.clone()),
        )
    };
    let max_attempts = inner.config.max_attempts;
    let mut prior_attempts: Vec<String> = Vec::new();

    loop {
        if handle.cancel.is_cancelled() {
            return StepFlow::Cancelled;
        }

        // Begin the attempt and gather what the command request needs
        let (attempt, target, step_target, context) = {
            let mut task = handle.task.lock().await;
            let step_target = task
                .step(number)
                .and_then(|s| s.bound_target())
                .map(str::to_string);
            let target = step_target
                .clone()
                .or_else(|| task.bound_target().map(str::to_string));
            let context = command_context(&task);
            let Some(step) = task.step_mut(number) else {
                return StepFlow::Continue;
            };
            match step.begin_attempt(max_attempts) {
                Ok(attempt) => (attempt, target, step_target, context),
                Err(e) => {
                    // Only reachable for a step reloaded with its budget spent
                    if let Err(fail_err) = step.fail(FailureKind::Execution, e.to_string()) {
                        tracing::warn!("Step {} could not fail: {}", number, fail_err);
                    }
                    let attempts = step.attempts();
                    inner.persist(&task).await;
                    handle.events.emit(
                        Some(number),
                        EventKind::StepFailed {
                            attempts,
                            kind: FailureKind::Execution,
                            reason: e.to_string(),
                            category: None,
                        },
                    );
                    return StepFlow::Continue;
                }
            }
        };

        let concrete = if prior_attempts.is_empty() && feedback.is_none() {
            concrete_command(&description, target.as_deref())
        } else {
            None
        };
        let command = match concrete {
            Some(command) => Ok(command),
            None => {
                let request = CommandRequest {
                    step_description: description.clone(),
                    prior_attempts: prior_attempts.clone(),
                    rejection_reason: feedback.clone(),
                    bound_target: target.clone(),
                    context,
                };
                tokio::select! {
                    _ = handle.cancel.cancelled() => return cancel_step(handle, number).await,
                    result = inner.planner.regenerate_command(&request) => result,
                }
            }
        };

        let command = match command {
            Ok(command) => command,
            Err(e) => {
                let reason = planner_failure(&e);
                let error = StepError::new(FailureKind::Planner, reason.clone());
                if record_failure(inner, handle, number, attempt, error).await {
                    return StepFlow::Continue;
                }
                feedback = Some(reason);
                continue;
            }
        };

        {
            let mut task = handle.task.lock().await;
            if let Some(step) = task.step_mut(number) {
                step.set_last_command(&command);
            }
        }
        handle.events.emit(
            Some(number),
            EventKind::StepAttempt {
                attempt,
                command: command.clone(),
            },
        );
        prior_attempts.push(command.clone());

        let verdict = inner.validator.validate(
            task_id,
            number,
            &description,
            &command,
            step_target.as_deref(),
            bypass,
        );
        if !verdict.accepted {
            if verdict.is_safety_rejection() {
                block_step(inner, handle, number, &command, verdict.explanation()).await;
                return StepFlow::Continue;
            }
            let reason = verdict.explanation();
            let error = StepError::new(FailureKind::Validation, reason.clone());
            if record_failure(inner, handle, number, attempt, error).await {
                return StepFlow::Continue;
            }
            feedback = Some(reason);
            continue;
        }

        let result = tokio::select! {
            // Dropping the run future kills the process
            _ = handle.cancel.cancelled() => return cancel_step(handle, number).await,
            result = inner.runner.run(&command, inner.config.exec_timeout) => result,
        };

        let (reason, category) = match result {
            Ok(output) if output.succeeded(expect.as_deref()) => {
                complete_step(inner, handle, number, attempt, &command, output).await;
                return StepFlow::Continue;
            }
            Ok(output) => (output.failure_summary(), classify_failure(&output)),
            Err(e) => (e.to_string(), e.category()),
        };
        let error = StepError::new(FailureKind::Execution, reason.clone()).with_category(category);
        if record_failure(inner, handle, number, attempt, error).await {
            return StepFlow::Continue;
        }
        feedback = Some(format!("{} ({}: {})", reason, category, category.suggestion()));
    }
}

fn planner_failure(error: &PlannerError) -> String {
    format!("no usable command: {}", error)
}

/// Retry, or fail the step once its attempts are spent or a retry cannot
/// help. Returns true if the step is now terminal.
async fn record_failure(inner: &EngineInner, handle: &TaskHandle, number: u32, attempt: u32, error: StepError) -> bool {
    let mut task = handle.task.lock().await;
    let Some(step) = task.step_mut(number) else {
        return true;
    };
    let (kind, category, reason) = (error.kind, error.category, error.reason.clone());

    let hopeless = category.is_some_and(|c| !c.is_retryable());
    if attempt >= inner.config.max_attempts || hopeless {
        if let Err(e) = step.fail_with(error) {
            tracing::warn!("Step {} could not fail: {}", number, e);
        }
        let attempts = step.attempts();
        inner.persist(&task).await;
        tracing::warn!(step = number, attempts, ?category, "Step failed: {}", reason);
        handle.events.emit(
            Some(number),
            EventKind::StepFailed {
                attempts,
                kind,
                reason,
                category,
            },
        );
        return true;
    }

    if let Err(e) = step.retry_with(error) {
        tracing::warn!("Step {} could not retry: {}", number, e);
    }
    tracing::debug!(step = number, attempt, ?category, "Retrying step: {}", reason);
    handle.events.emit(
        Some(number),
        EventKind::StepRetry {
            attempt,
            kind,
            reason,
            category,
        },
    );
    false
}

async fn block_step(inner: &EngineInner, handle: &TaskHandle, number: u32, command: &str, reason: String) {
    let mut task = handle.task.lock().await;
    if let Some(step) = task.step_mut(number) {
        if let Err(e) = step.block(reason.clone()) {
            tracing::warn!("Step {} could not block: {}", number, e);
        }
    }
    inner.persist(&task).await;
    tracing::warn!(step = number, "Step blocked: {}", reason);
    handle.events.emit(
        Some(number),
        EventKind::StepBlocked {
            command: command.to_string(),
            reason,
        },
    );
}

async fn complete_step(
    inner: &EngineInner,
    handle: &TaskHandle,
    number: u32,
    attempt: u32,
    command: &str,
    output: CommandOutput,
) {
    let rendered = output.render();
    let mut task = handle.task.lock().await;
    if let Some(step) = task.step_mut(number) {
        if let Err(e) = step.complete(rendered.clone()) {
            tracing::warn!("Step {} could not complete: {}", number, e);
        }
    }
    let added = task.merge_hosts(parse_nmap_hosts(&output.stdout));
    if added > 0 {
        tracing::debug!(step = number, "Step output added {} hosts", added);
    }
    inner.persist(&task).await;
    handle.events.emit(
        Some(number),
        EventKind::StepSuccess {
            attempt,
            command: command.to_string(),
            exit_status: output.exit_status,
            output: rendered.chars().take(EVENT_OUTPUT_CHARS).collect(),
        },
    );
}

/// Fail the in-flight attempt of a cancelled step.
async fn cancel_step(handle: &TaskHandle, number: u32) -> StepFlow {
    let mut task = handle.task.lock().await;
    if let Some(step) = task.step_mut(number) {
        if step.status() == StepStatus::Running {
            if let Err(e) = step.fail(FailureKind::Execution, "cancelled") {
                tracing::warn!("Step {} could not fail: {}", number, e);
            }
        }
    }
    StepFlow::Cancelled
}

async fn fail_task(inner: &EngineInner, handle: &TaskHandle, reason: &str) {
    let mut task = handle.task.lock().await;
    if task.status().is_terminal() {
        return;
    }
    if let Err(e) = task.fail(reason) {
        tracing::warn!("Task could not fail: {}", e);
        return;
    }
    inner.persist(&task).await;
    inner.validator.tracker().reset(task.id());
    tracing::warn!(task_id = %task.id(), "Task failed: {}", reason);
    handle.events.emit(
        None,
        EventKind::TaskFailed {
            reason: reason.to_string(),
        },
    );
    handle.publish_status(task.status());
}

async fn finish(inner: &EngineInner, handle: &TaskHandle) {
    let mut task = handle.task.lock().await;
    if *task.status() != TaskStatus::Running {
        return;
    }
    let count = |status: StepStatus| task.steps().iter().filter(|s| s.status() == status).count();
    let (completed, failed, blocked) = (
        count(StepStatus::Completed),
        count(StepStatus::Failed),
        count(StepStatus::Blocked),
    );
    if let Err(e) = task.complete() {
        tracing::warn!("Task could not complete: {}", e);
        return;
    }
    inner.persist(&task).await;
    inner.validator.tracker().reset(task.id());
    tracing::info!(
        task_id = %task.id(),
        completed,
        failed,
        blocked,
        "Task completed"
    );
    handle.events.emit(
        None,
        EventKind::StepsCompleted {
            completed,
            failed,
            blocked,
        },
    );
    handle.publish_status(task.status());

    let objective = task.objective().to_string();
    drop(task);
    let summary = format!(
        "{} of {} steps succeeded ({} failed, {} blocked)",
        completed,
        completed + failed + blocked,
        failed,
        blocked
    );
    inner.context.remember(&objective, &summary).await;
}
