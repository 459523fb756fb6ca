//! Runtime configuration loaded from environment variables
//!
//! Every knob has a default so a bare environment boots a working engine;
//! values that fail to parse are reported rather than silently replaced.

use std::env;
use std::time::Duration;

use argyll_domain::{BackoffKind, WorkConfig};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Engine-wide runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// HTTP listener host for the transport adapter
    pub api_host: String,

    /// HTTP listener port for the transport adapter
    pub api_port: u16,

    /// Base URL for async webhook callbacks
    pub webhook_base_url: String,

    /// Default per-invocation deadline when a step omits one
    pub step_timeout: Duration,

    /// Flow materialized-view LRU capacity
    pub flow_cache_size: usize,

    /// Memoization LRU capacity
    pub memo_cache_size: usize,

    /// Compiled-script LRU capacity
    pub script_cache_size: usize,

    /// Imperative-dialect engine pool size
    pub script_pool_size: usize,

    /// Retry defaults applied when a step leaves fields zeroed
    pub retry_defaults: WorkConfig,
}

impl RuntimeConfig {
    /// Load configuration from the environment.
    ///
    /// Recognized variables: `API_HOST`, `API_PORT`, `WEBHOOK_BASE_URL`,
    /// `STEP_TIMEOUT_MS`, `FLOW_CACHE_SIZE`, `MEMO_CACHE_SIZE`,
    /// `SCRIPT_CACHE_SIZE`, `SCRIPT_POOL_SIZE`, `RETRY_MAX_RETRIES`,
    /// `RETRY_INIT_BACKOFF_MS`, `RETRY_MAX_BACKOFF_MS`,
    /// `RETRY_BACKOFF_TYPE` (`fixed` | `linear` | `exponential`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_host: env_or("API_HOST", "0.0.0.0"),
            api_port: parse_env("API_PORT", 8080)?,
            webhook_base_url: env_or("WEBHOOK_BASE_URL", "http://localhost:8080"),
            step_timeout: Duration::from_millis(parse_env("STEP_TIMEOUT_MS", 30_000)?),
            flow_cache_size: parse_env("FLOW_CACHE_SIZE", 1_024)?,
            memo_cache_size: parse_env("MEMO_CACHE_SIZE", 1_024)?,
            script_cache_size: parse_env("SCRIPT_CACHE_SIZE", 1_024)?,
            script_pool_size: parse_env("SCRIPT_POOL_SIZE", 10)?,
            retry_defaults: WorkConfig {
                max_retries: parse_env("RETRY_MAX_RETRIES", 3)?,
                init_backoff_ms: parse_env("RETRY_INIT_BACKOFF_MS", 1_000)?,
                max_backoff_ms: parse_env("RETRY_MAX_BACKOFF_MS", 60_000)?,
                backoff: parse_backoff()?,
                parallelism: 1,
            },
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => parse_raw(name, raw),
    }
}

fn parse_raw<T: std::str::FromStr>(name: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue { name, value: raw })
}

fn parse_backoff() -> Result<BackoffKind, ConfigError> {
    match env::var("RETRY_BACKOFF_TYPE") {
        Err(_) => Ok(BackoffKind::Exponential),
        Ok(raw) => match raw.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(ConfigError::InvalidValue {
                name: "RETRY_BACKOFF_TYPE",
                value: raw,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Serialized by the single-threaded default test runner assumption:
        // only read variables that are unlikely to be set
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.script_pool_size, 10);
        assert_eq!(config.retry_defaults.max_retries, 3);
        assert_eq!(config.retry_defaults.backoff, BackoffKind::Exponential);
    }

    #[test]
    fn test_invalid_value_reported() {
        let result: Result<u16, ConfigError> = parse_raw("API_PORT", "not-a-number".to_string());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("API_PORT"));
        assert!(err.to_string().contains("not-a-number"));
    }

    #[test]
    fn test_parse_raw_accepts_numbers() {
        let parsed: u64 = parse_raw("STEP_TIMEOUT_MS", "1500".to_string()).unwrap();
        assert_eq!(parsed, 1_500);
    }
}
