//! Step planner adapter.
//!
//! Turns a [`PlanningContext`] into an ordered step list and, per attempt, a
//! single shell command for a step. The model is a black box: this module only
//! bounds the call in time and checks the minimal shape of what comes back.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::PlanningContext;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::validator::{classify_tool, ToolFamily};

/// Literal the planner uses for a target that is not known yet.
pub const TARGET_PLACEHOLDER: &str = "TARGET_IP";

/// Substrings that mark a generated command as not runnable.
const PLACEHOLDERS: &[&str] = &["<ip", "[ip", "<target", "TARGET_IP", "IP_CAMERA", "HOST_IP"];

const PLAN_SYSTEM_PROMPT: &str = "You plan authorized security assessments on the operator's own network. \
Break the objective into a short ordered list of concrete steps. Each step does one thing \
(discover, enumerate, retrieve, research, exploit, capture) and can be done with one shell command. \
When a step acts on the target device and its address is not listed, refer to it as TARGET_IP. \
Reply with JSON only: {\"steps\":[{\"description\":\"...\",\"expect\":\"optional stdout marker of success\"}]}";

const COMMAND_SYSTEM_PROMPT: &str = "You write exactly one shell command for one step of an authorized \
security assessment. Reply with the command only: no explanation, no markdown, no placeholders. \
Use only the target address you are given.";

/// One planned step as produced by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    /// Stdout marker that counts as success even on a non-zero exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            expect: None,
        }
    }
}

/// Everything needed to ask for a (new) command for a step.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub step_description: String,
    /// Commands already tried for this step, oldest first
    pub prior_attempts: Vec<String>,
    /// Why the last attempt was rejected or failed
    pub rejection_reason: Option<String>,
    pub bound_target: Option<String>,
    /// Rendered planning context plus results of earlier steps
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    #[error("Planner timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Unparsable planner response: {0}")]
    Unparsable(String),

    #[error("Planner unavailable: {0}")]
    Unavailable(String),
}

/// Produces plans and commands.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Ordered steps for the objective; never empty on success.
    async fn generate_steps(&self, context: &PlanningContext) -> Result<Vec<PlannedStep>, PlannerError>;

    /// One runnable command for a step.
    async fn regenerate_command(&self, request: &CommandRequest) -> Result<String, PlannerError>;
}

/// Planner backed by a chat-completion model.
pub struct LlmPlanner {
    client: Arc<dyn LlmClient>,
    model: String,
    timeout: Duration,
    max_tokens: u64,
    max_steps: usize,
}

impl LlmPlanner {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            timeout: Duration::from_secs(45),
            max_tokens: 800,
            max_steps: 8,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// `complete(prompt, max_tokens, timeout) -> text`
    async fn complete(&self, system: &str, prompt: String) -> Result<String, PlannerError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        let options = ChatOptions {
            temperature: Some(0.2),
            max_tokens: Some(self.max_tokens),
        };

        let call = self
            .client
            .chat_completion_with_options(&self.model, &messages, options);
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(PlannerError::Unavailable(e.to_string())),
            Err(_) => return Err(PlannerError::Timeout(self.timeout)),
        };

        match response.content {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(PlannerError::Unparsable("empty response".to_string())),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn generate_steps(&self, context: &PlanningContext) -> Result<Vec<PlannedStep>, PlannerError> {
        let prompt = format!(
            "{}\nPlan at most {} steps.",
            context.render(),
            self.max_steps
        );
        let text = self.complete(PLAN_SYSTEM_PROMPT, prompt).await?;
        let steps = parse_steps(&text, self.max_steps)?;
        tracing::debug!("Planner produced {} steps", steps.len());
        Ok(steps)
    }

    async fn regenerate_command(&self, request: &CommandRequest) -> Result<String, PlannerError> {
        let text = self
            .complete(COMMAND_SYSTEM_PROMPT, command_prompt(request))
            .await?;
        extract_command(&text)
    }
}

/// Deterministic prompt for a command request.
pub fn command_prompt(request: &CommandRequest) -> String {
    let mut prompt = String::new();
    if !request.context.trim().is_empty() {
        prompt.push_str(request.context.trim_end());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("## Step\n{}\n", request.step_description));
    match &request.bound_target {
        Some(target) => prompt.push_str(&format!("\nTarget address: {}\n", target)),
        None => prompt.push_str("\nNo target address is bound; do not invent one.\n"),
    }
    if !request.prior_attempts.is_empty() {
        prompt.push_str("\n## Already tried\n");
        for cmd in &request.prior_attempts {
            prompt.push_str(&format!("- {}\n", cmd));
        }
    }
    if let Some(reason) = &request.rejection_reason {
        prompt.push_str(&format!(
            "\nThe last command was not accepted ({}). Write a different command.\n",
            reason
        ));
    }
    prompt
}

fn numbered_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)[.)]\s+(.+?)\s*$").expect("valid numbered list regex"))
}

/// Body of the first fenced block, if there is one.
fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

fn json_candidates(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    if let Some(body) = fenced_body(text) {
        out.push(body.trim());
    }
    out.push(text.trim());
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(s), Some(e)) = (text.find(open), text.rfind(close)) {
            if s < e {
                out.push(&text[s..=e]);
            }
        }
    }
    out
}

fn step_from_value(value: &Value) -> Option<PlannedStep> {
    match value {
        Value::String(s) => Some(PlannedStep::new(s.trim())),
        Value::Object(map) => {
            let description = map
                .get("description")
                .or_else(|| map.get("step"))
                .and_then(Value::as_str)?;
            let expect = map
                .get("expect")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(PlannedStep {
                description: description.trim().to_string(),
                expect,
            })
        }
        _ => None,
    }
}

/// Parse a planning response.
///
/// Accepts `{"steps": [...]}`, a bare array of strings or objects (fenced or
/// not), or a numbered list. The result is capped at `max_steps`.
pub fn parse_steps(text: &str, max_steps: usize) -> Result<Vec<PlannedStep>, PlannerError> {
    let mut steps: Vec<PlannedStep> = Vec::new();

    for candidate in json_candidates(text) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let items = match &value {
            Value::Object(map) => map.get("steps").and_then(Value::as_array),
            Value::Array(items) => Some(items),
            _ => None,
        };
        if let Some(items) = items {
            steps = items.iter().filter_map(step_from_value).collect();
            break;
        }
    }

    if steps.is_empty() {
        steps = text
            .lines()
            .filter_map(|line| numbered_re().captures(line))
            .map(|caps| PlannedStep::new(caps[2].trim_matches('*').trim()))
            .collect();
    }

    steps.retain(|s| !s.description.is_empty());
    if steps.is_empty() {
        let preview: String = text.chars().take(200).collect();
        return Err(PlannerError::Unparsable(format!("no steps found in: {}", preview)));
    }
    steps.truncate(max_steps);
    Ok(steps)
}

fn has_placeholder(line: &str) -> bool {
    let lower = line.to_lowercase();
    PLACEHOLDERS.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// A known tool, or a script or binary addressed by path.
fn looks_like_command(line: &str) -> bool {
    if matches!(classify_tool(line), Some(f) if f != ToolFamily::Other) {
        return true;
    }
    line.split_whitespace()
        .next()
        .is_some_and(|first| first.starts_with("./") || first.starts_with("~/") || first.starts_with('/'))
}

/// Pull one runnable command line out of a model response.
pub fn extract_command(text: &str) -> Result<String, PlannerError> {
    let body = fenced_body(text).unwrap_or(text);
    let mut saw_placeholder = false;

    for raw in body.lines() {
        let mut line = raw.trim().trim_matches('`').trim();
        if let Some(rest) = line.strip_prefix("$ ") {
            line = rest.trim();
        }
        if line.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("command:")) {
            line = line[8..].trim().trim_matches('`').trim();
        }
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if !looks_like_command(line) {
            continue;
        }
        if has_placeholder(line) {
            saw_placeholder = true;
            continue;
        }
        return Ok(line.to_string());
    }

    Err(PlannerError::Unparsable(if saw_placeholder {
        "command contains an unresolved placeholder".to_string()
    } else {
        "no command found in response".to_string()
    }))
}

/// Use the step description itself as the command when it already is one.
///
/// `TARGET_IP` is replaced with the bound target; without one, a description
/// that needs the target is not concrete.
pub fn concrete_command(description: &str, bound_target: Option<&str>) -> Option<String> {
    let text = description.trim().trim_matches('`').trim();
    let family = classify_tool(text)?;
    if family == ToolFamily::Other {
        return None;
    }
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let has_operand = tokens[1..].iter().any(|t| {
        t.starts_with('-') || t.contains(['.', '/', ':']) || t.contains(TARGET_PLACEHOLDER)
    });
    if !has_operand {
        return None;
    }

    let command = if text.contains(TARGET_PLACEHOLDER) {
        text.replace(TARGET_PLACEHOLDER, bound_target?)
    } else {
        text.to_string()
    };
    if has_placeholder(&command) {
        return None;
    }
    Some(command)
}
