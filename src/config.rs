//! Configuration management for redline.
//!
//! Configuration is read from environment variables:
//! - `OPENROUTER_API_KEY` - Required. Key for the text-generation service.
//! - `DEFAULT_MODEL` - Optional. Planning model. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `REDLINE_STATE_DIR` - Optional. Where tasks and checkpoints are persisted. Defaults to `./.redline`.
//! - `REDLINE_WORKING_DIR` - Optional. Working directory for executed commands. Defaults to current directory.
//! - `REDLINE_DISCOVERY_RANGE` - Optional. Ping-sweep range used to seed network facts (e.g. `192.168.1.1-50`).
//! - `REDLINE_MAX_ATTEMPTS` - Optional. Attempts per step. Defaults to `3`.
//! - `REDLINE_DIVERSITY_WINDOW` - Optional. Preceding steps checked for tool repetition. Defaults to `2`.
//! - `REDLINE_CONFIDENCE_THRESHOLD` - Optional. Minimum target confidence (0-10). Defaults to `7`.
//! - `REDLINE_PLANNER_TIMEOUT_SECS` - Optional. Text-generation timeout. Defaults to `45`.
//! - `REDLINE_EXEC_TIMEOUT_SECS` - Optional. Command timeout. Defaults to `60`.
//! - `REDLINE_MAX_STEPS` - Optional. Upper bound on planned steps. Defaults to `8`.
//! - `REDLINE_EXTRA_FORBIDDEN` - Optional. Extra forbidden regexes, separated by `;;`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Weights used by the target candidate resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    /// Added when a hint is a substring of the host's hostname
    pub hostname_match: u32,
    /// Added when a hint matches the host's hardware vendor
    pub vendor_match: u32,
    /// Added when an expected port is open on the host
    pub port_match: u32,
    /// Score that maps to confidence 10
    pub confidence_scale: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            hostname_match: 3,
            vendor_match: 3,
            port_match: 2,
            confidence_scale: 10,
        }
    }
}

/// Policy knobs for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts per step before it is marked failed
    pub max_attempts: u32,

    /// Number of immediately preceding steps considered by the diversity check
    pub diversity_window: usize,

    /// Minimum confidence (0-10) for autonomous target binding
    pub confidence_threshold: u8,

    /// Timeout for each text-generation call
    pub planner_timeout: Duration,

    /// Timeout for each executed command
    pub exec_timeout: Duration,

    /// Upper bound on the number of planned steps
    pub max_steps: usize,

    /// Output tokens requested from the planner
    pub planner_max_tokens: u64,

    /// Resolver weights
    pub weights: ScoringWeights,

    /// Forbidden patterns appended to the built-in safety list
    pub extra_forbidden_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            diversity_window: 2,
            confidence_threshold: 7,
            planner_timeout: Duration::from_secs(45),
            exec_timeout: Duration::from_secs(60),
            max_steps: 8,
            planner_max_tokens: 800,
            weights: ScoringWeights::default(),
            extra_forbidden_patterns: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load engine policy from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_attempts = env_parse("REDLINE_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "REDLINE_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let confidence_threshold =
            env_parse("REDLINE_CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?;
        if confidence_threshold > 10 {
            return Err(ConfigError::InvalidValue(
                "REDLINE_CONFIDENCE_THRESHOLD".to_string(),
                format!("{} is outside 0-10", confidence_threshold),
            ));
        }

        let extra_forbidden_patterns = std::env::var("REDLINE_EXTRA_FORBIDDEN")
            .map(|raw| {
                raw.split(";;")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            max_attempts,
            diversity_window: env_parse("REDLINE_DIVERSITY_WINDOW", defaults.diversity_window)?,
            confidence_threshold,
            planner_timeout: Duration::from_secs(env_parse(
                "REDLINE_PLANNER_TIMEOUT_SECS",
                defaults.planner_timeout.as_secs(),
            )?),
            exec_timeout: Duration::from_secs(env_parse(
                "REDLINE_EXEC_TIMEOUT_SECS",
                defaults.exec_timeout.as_secs(),
            )?),
            max_steps: env_parse("REDLINE_MAX_STEPS", defaults.max_steps)?,
            planner_max_tokens: defaults.planner_max_tokens,
            weights: ScoringWeights::default(),
            extra_forbidden_patterns,
        })
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Model identifier used for planning and command generation
    pub default_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory for persisted tasks
    pub state_dir: PathBuf,

    /// Working directory for executed commands
    pub working_dir: PathBuf,

    /// Optional ping-sweep range used to seed network facts
    pub discovery_range: Option<String>,

    /// Engine policy
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3000u16)?;

        let state_dir = std::env::var("REDLINE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".redline"));

        let working_dir = std::env::var("REDLINE_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let discovery_range = std::env::var("REDLINE_DISCOVERY_RANGE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            api_key,
            default_model,
            host,
            port,
            state_dir,
            working_dir,
            discovery_range,
            engine: EngineConfig::from_env()?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, state_dir: PathBuf) -> Self {
        Self {
            api_key,
            default_model,
            host: "127.0.0.1".to_string(),
            port: 3000,
            state_dir,
            working_dir: PathBuf::from("."),
            discovery_range: None,
            engine: EngineConfig::default(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults_match_policy() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.diversity_window, 2);
        assert_eq!(cfg.confidence_threshold, 7);
        assert_eq!(cfg.weights.hostname_match, 3);
        assert_eq!(cfg.weights.vendor_match, 3);
        assert_eq!(cfg.weights.port_match, 2);
    }

    #[test]
    fn test_env_parse_reports_variable_name() {
        std::env::set_var("REDLINE_TEST_BAD_NUMBER", "many");
        let err = env_parse::<u32>("REDLINE_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("REDLINE_TEST_BAD_NUMBER"));
        std::env::remove_var("REDLINE_TEST_BAD_NUMBER");

        assert_eq!(env_parse::<u32>("REDLINE_TEST_UNSET_NUMBER", 5).unwrap(), 5);
    }
}
