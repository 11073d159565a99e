//! Command execution collaborator.
//!
//! Commands run through `/bin/sh -c` in the configured working directory.
//! Sandboxing is the deployment's job; this module only bounds time, kills the
//! process when the caller gives up, and makes the output safe to log and to
//! feed back into prompts.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Default cap on each captured stream.
const MAX_STREAM_CHARS: usize = 10_000;

/// Raw result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Success iff the process exited 0, or it exited at all and stdout
    /// contains the step's expected marker.
    pub fn succeeded(&self, expect: Option<&str>) -> bool {
        match self.exit_status {
            Some(0) => true,
            Some(_) => expect.is_some_and(|marker| !marker.is_empty() && self.stdout.contains(marker)),
            None => false,
        }
    }

    /// Short failure description for retry feedback.
    pub fn failure_summary(&self) -> String {
        let code = self
            .exit_status
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "killed by signal".to_string());
        let tail = last_line(&self.stderr).or_else(|| last_line(&self.stdout));
        match tail {
            Some(line) => format!("{}: {}", code, line),
            None => code,
        }
    }

    /// Combined text recorded as the step result.
    pub fn render(&self) -> String {
        let mut result = format!(
            "Exit code: {}\n",
            self.exit_status
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        );
        if !self.stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&self.stderr);
        }
        result
    }
}

/// Coarse cause of a failed command, used to steer the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    Permission,
    ConnectionFailed,
    MissingTool,
    /// The target host cannot be reached at all
    Unreachable,
    NoOutput,
    Other,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Permission => "permission",
            FailureCategory::ConnectionFailed => "connection_failed",
            FailureCategory::MissingTool => "missing_tool",
            FailureCategory::Unreachable => "unreachable",
            FailureCategory::NoOutput => "no_output",
            FailureCategory::Other => "other",
        }
    }

    /// Directive for the next command request.
    pub fn suggestion(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "narrow the scope or lower per-host timeouts so the command finishes in time",
            FailureCategory::Permission => "use an unprivileged variant, e.g. a TCP connect scan instead of a SYN scan",
            FailureCategory::ConnectionFailed => "check the port and protocol, or scan which services are actually open",
            FailureCategory::MissingTool => "use a different tool that is installed",
            FailureCategory::Unreachable => "the host cannot be reached; another command will not help",
            FailureCategory::NoOutput => "add verbose output or target a service that answers",
            FailureCategory::Other => "try a different approach",
        }
    }

    /// Whether another command could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureCategory::Unreachable)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output fragments per category, checked in order.
const FAILURE_PATTERNS: &[(FailureCategory, &[&str])] = &[
    (FailureCategory::Timeout, &["timed out", "timeout"]),
    (
        FailureCategory::Permission,
        &[
            "permission denied",
            "operation not permitted",
            "requires root",
            "must be root",
            "are you root",
        ],
    ),
    (
        FailureCategory::MissingTool,
        &["command not found", ": not found", "no such file or directory"],
    ),
    (
        FailureCategory::Unreachable,
        &[
            "no route to host",
            "network is unreachable",
            "host is unreachable",
            "host seems down",
            "(0 hosts up)",
        ],
    ),
    (
        FailureCategory::ConnectionFailed,
        &[
            "connection refused",
            "connection reset",
            "failed to connect",
            "couldn't connect",
            "could not resolve",
            "failed to resolve",
        ],
    ),
];

/// Classify a failed command by exit status and output.
pub fn classify_failure(output: &CommandOutput) -> FailureCategory {
    match output.exit_status {
        Some(126) => return FailureCategory::Permission,
        Some(127) => return FailureCategory::MissingTool,
        _ => {}
    }

    let text = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();
    for (category, patterns) in FAILURE_PATTERNS {
        if patterns.iter().any(|p| text.contains(p)) {
            return *category;
        }
    }

    if text.trim().is_empty() {
        FailureCategory::NoOutput
    } else {
        FailureCategory::Other
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("Command timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Execution collaborator unreachable: {0}")]
    Unreachable(String),
}

impl ExecError {
    pub fn category(&self) -> FailureCategory {
        match self {
            ExecError::Timeout(_) => FailureCategory::Timeout,
            // The runner being down says nothing about the target
            ExecError::Unreachable(_) => FailureCategory::Other,
        }
    }
}

/// Runs shell commands on behalf of the engine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, giving up after `timeout`.
    ///
    /// Dropping the returned future must stop the command.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// Runs commands with `/bin/sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    working_dir: PathBuf,
    max_stream_chars: usize,
}

impl ShellRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            max_stream_chars: MAX_STREAM_CHARS,
        }
    }

    pub fn with_max_output(mut self, chars: usize) -> Self {
        self.max_stream_chars = chars;
        self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        tracing::info!("Executing command in {:?}: {}", self.working_dir, command);

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!("Command execution failed: {}", e);
                return Err(ExecError::Unreachable(e.to_string()));
            }
            Err(_) => {
                tracing::warn!("Command timed out after {:?}", timeout);
                return Err(ExecError::Timeout(timeout));
            }
        };

        let result = CommandOutput {
            exit_status: output.status.code(),
            stdout: truncate(sanitize_output(&output.stdout), self.max_stream_chars),
            stderr: truncate(sanitize_output(&output.stderr), self.max_stream_chars),
        };

        tracing::debug!(
            "Command completed: exit={:?}, stdout_len={}, stderr_len={}",
            result.exit_status,
            result.stdout.len(),
            result.stderr.len()
        );

        Ok(result)
    }
}

/// Make process output safe to log and to put in a prompt.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% control bytes is treated as binary
    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

fn truncate(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n... [output truncated]", &text[..cut]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_judgement() {
        let ok = CommandOutput {
            exit_status: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded(None));

        let warned = CommandOutput {
            exit_status: Some(1),
            stdout: "Host is up (0.0021s latency).".to_string(),
            stderr: String::new(),
        };
        assert!(!warned.succeeded(None));
        assert!(warned.succeeded(Some("Host is up")));
        assert!(!warned.succeeded(Some("open")));

        // Partial output from a killed process never counts
        let killed = CommandOutput {
            exit_status: None,
            stdout: "Host is up".to_string(),
            stderr: String::new(),
        };
        assert!(!killed.succeeded(Some("Host is up")));
    }

    #[test]
    fn test_failure_summary_prefers_stderr() {
        let out = CommandOutput {
            exit_status: Some(2),
            stdout: "partial\n".to_string(),
            stderr: "curl: (7) Failed to connect\n\n".to_string(),
        };
        assert_eq!(out.failure_summary(), "exit code 2: curl: (7) Failed to connect");
    }

    fn failed(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_status: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_failure_categories() {
        let cases = [
            (failed(28, "curl: (28) Connection timed out after 5001 ms"), FailureCategory::Timeout),
            (
                failed(1, "You requested a scan type which requires root privileges."),
                FailureCategory::Permission,
            ),
            (failed(126, ""), FailureCategory::Permission),
            (failed(127, "sh: 1: masscan: not found"), FailureCategory::MissingTool),
            (
                failed(7, "curl: (7) Failed to connect to 10.0.0.5 port 80: No route to host"),
                FailureCategory::Unreachable,
            ),
            (
                failed(1, "Note: Host seems down. If it is really up, try -Pn"),
                FailureCategory::Unreachable,
            ),
            (
                failed(7, "curl: (7) Failed to connect to 10.0.0.5 port 80: Connection refused"),
                FailureCategory::ConnectionFailed,
            ),
            (failed(1, ""), FailureCategory::NoOutput),
            (failed(2, "unexpected argument"), FailureCategory::Other),
        ];
        for (output, expected) in cases {
            assert_eq!(classify_failure(&output), expected, "{:?}", output.stderr);
        }
    }

    #[test]
    fn test_only_unreachable_stops_retries() {
        assert!(!FailureCategory::Unreachable.is_retryable());
        assert!(FailureCategory::ConnectionFailed.is_retryable());
        assert_eq!(ExecError::Timeout(Duration::from_secs(5)).category(), FailureCategory::Timeout);
        assert_eq!(
            serde_json::to_string(&FailureCategory::MissingTool).unwrap(),
            "\"missing_tool\""
        );
    }

    #[test]
    fn test_sanitize_output() {
        assert_eq!(sanitize_output(b"ok\x00\x07 done\n"), "ok done\n");
        let binary = vec![0x01u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(20);
        let cut = truncate(text, 5);
        assert!(cut.starts_with("ééééé\n"));
        assert!(cut.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_shell_runner_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());
        let out = runner
            .run("echo hello; echo oops >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_status, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());
        let err = runner
            .run("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }
}
