//! Work-item retry and parallelism configuration

use serde::{Deserialize, Serialize};

/// Backoff growth curve between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay
    Fixed,

    /// Delay grows linearly with the attempt number
    Linear,

    /// Delay doubles each attempt
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Per-step work execution configuration.
///
/// Zero-valued fields fall back to engine-wide defaults when the step is
/// dispatched (see `WorkConfig::merged_with`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkConfig {
    /// Maximum retry attempts after the first failure.
    /// `-1` means unlimited; `0` falls back to the engine default.
    pub max_retries: i32,

    /// Initial backoff delay in milliseconds
    pub init_backoff_ms: u64,

    /// Upper bound on the backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Growth curve
    pub backoff: BackoffKind,

    /// Concurrent work items allowed for this step (0 falls back, engine
    /// default is 1)
    pub parallelism: usize,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            init_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff: BackoffKind::default(),
            parallelism: 0,
        }
    }
}

impl WorkConfig {
    /// Resolve zero-valued fields against engine-wide defaults
    #[must_use]
    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            max_retries: if self.max_retries == 0 {
                defaults.max_retries
            } else {
                self.max_retries
            },
            init_backoff_ms: if self.init_backoff_ms == 0 {
                defaults.init_backoff_ms
            } else {
                self.init_backoff_ms
            },
            max_backoff_ms: if self.max_backoff_ms == 0 {
                defaults.max_backoff_ms
            } else {
                self.max_backoff_ms
            },
            backoff: self.backoff,
            parallelism: if self.parallelism == 0 {
                defaults.parallelism.max(1)
            } else {
                self.parallelism
            },
        }
    }

    /// Retries remaining after `retry_count` attempts, or `None` when
    /// unlimited
    #[must_use]
    pub fn retries_remaining(&self, retry_count: u32) -> Option<u32> {
        if self.max_retries < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let max = self.max_retries as u32;
        Some(max.saturating_sub(retry_count))
    }

    /// Delay before the given 1-based retry attempt, clamped to
    /// `[init_backoff_ms, max_backoff_ms]`.
    ///
    /// The growth factor is `1`, `attempt`, or `2^attempt`.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = match self.backoff {
            BackoffKind::Fixed => 1,
            BackoffKind::Linear => u64::from(attempt.max(1)),
            BackoffKind::Exponential => 1u64.checked_shl(attempt).unwrap_or(u64::MAX),
        };
        let raw = self.init_backoff_ms.saturating_mul(factor);
        let ceiling = if self.max_backoff_ms == 0 {
            u64::MAX
        } else {
            self.max_backoff_ms
        };
        raw.clamp(self.init_backoff_ms, ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_with_defaults() {
        let defaults = WorkConfig {
            max_retries: 3,
            init_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff: BackoffKind::Exponential,
            parallelism: 1,
        };

        let merged = WorkConfig::default().merged_with(&defaults);
        assert_eq!(merged.max_retries, 3);
        assert_eq!(merged.init_backoff_ms, 100);
        assert_eq!(merged.parallelism, 1);

        let explicit = WorkConfig {
            max_retries: -1,
            init_backoff_ms: 200,
            ..Default::default()
        }
        .merged_with(&defaults);
        assert_eq!(explicit.max_retries, -1);
        assert_eq!(explicit.init_backoff_ms, 200);
    }

    #[test]
    fn test_fixed_delay() {
        let config = WorkConfig {
            init_backoff_ms: 200,
            max_backoff_ms: 10_000,
            backoff: BackoffKind::Fixed,
            ..Default::default()
        };
        assert_eq!(config.delay_ms(1), 200);
        assert_eq!(config.delay_ms(5), 200);
    }

    #[test]
    fn test_linear_delay() {
        let config = WorkConfig {
            init_backoff_ms: 100,
            max_backoff_ms: 350,
            backoff: BackoffKind::Linear,
            ..Default::default()
        };
        assert_eq!(config.delay_ms(1), 100);
        assert_eq!(config.delay_ms(2), 200);
        assert_eq!(config.delay_ms(4), 350); // clamped
    }

    #[test]
    fn test_exponential_delay() {
        let config = WorkConfig {
            init_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff: BackoffKind::Exponential,
            ..Default::default()
        };
        assert_eq!(config.delay_ms(1), 200);
        assert_eq!(config.delay_ms(2), 400);
        assert_eq!(config.delay_ms(3), 800);
        assert_eq!(config.delay_ms(10), 1_000); // clamped
    }

    #[test]
    fn test_retries_remaining() {
        let config = WorkConfig {
            max_retries: 2,
            ..Default::default()
        };
        assert_eq!(config.retries_remaining(0), Some(2));
        assert_eq!(config.retries_remaining(2), Some(0));

        let unlimited = WorkConfig {
            max_retries: -1,
            ..Default::default()
        };
        assert_eq!(unlimited.retries_remaining(100), None);
    }
}
