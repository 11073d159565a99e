//! Text-generation error types with retry classification.
//!
//! Transient errors (rate limits, 5xx, network) are retried by the client;
//! everything else surfaces to the caller immediately.

use std::time::Duration;

/// Classification of text-generation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LlmErrorKind {
    /// 429, retried with backoff
    #[error("Rate limited")]
    RateLimited,
    /// 5xx, retried
    #[error("Server error")]
    ServerError,
    /// Other 4xx (bad request, auth), never retried
    #[error("Client error")]
    ClientError,
    /// Connection failure or transport timeout, retried
    #[error("Network error")]
    NetworkError,
    /// Response body could not be understood
    #[error("Parse error")]
    ParseError,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }

    fn base_delay(&self) -> Duration {
        match self {
            LlmErrorKind::RateLimited => Duration::from_secs(5),
            LlmErrorKind::ServerError => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        }
    }
}

/// Error from a text-generation call.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}: {message}", .status_code.map(|c| format!(" (HTTP {})", c)).unwrap_or_default())]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// From a `Retry-After` header, when the provider sent one
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Build the error for a non-success HTTP response.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(classify_http_status(status), Some(status), body);
        if err.kind == LlmErrorKind::RateLimited {
            err.retry_after = retry_after;
        }
        err
    }

    pub fn network(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, None, message)
    }

    pub fn parse(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, None, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before retry `attempt` (0-based).
    ///
    /// Honors `Retry-After`; otherwise exponential backoff from a per-kind base
    /// with a small deterministic jitter, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }
        let secs = self
            .kind
            .base_delay()
            .as_secs()
            .saturating_mul(2u64.saturating_pow(attempt));
        let jitter = match secs / 4 {
            0 => 0,
            range => (u64::from(attempt) * 7) % range,
        };
        Duration::from_secs(secs.saturating_add(jitter).min(60))
    }
}

/// Retry policy for the client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Upper bound on total time spent retrying one request
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_retry_duration: Duration::from_secs(40),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}

/// Map an HTTP status code onto an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}
