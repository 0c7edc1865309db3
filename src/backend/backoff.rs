//! Transport-level retry policy with exponential backoff and jitter.
//!
//! Local Ollama rarely needs retries, so the default is
//! [`BackoffConfig::none()`]. Shared or remote servers should use
//! [`BackoffConfig::standard()`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for transient completion failures (429, 5xx, connection
/// errors). Delays are kept in milliseconds so the policy can live in a
/// config file.
///
/// # Example
///
/// ```
/// use ingest_pipeline::backend::BackoffConfig;
///
/// assert_eq!(BackoffConfig::none().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Retries after the first attempt. `0` disables retry.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Growth factor: `initial, initial * m, initial * m^2, ...`
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
    pub jitter: JitterStrategy,
    pub retryable_statuses: Vec<u16>,
    /// Prefer a server `Retry-After` hint over the computed delay.
    pub respect_retry_after: bool,
}

/// How randomness is applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// Exactly the computed delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl BackoffConfig {
    /// No retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// 3 retries, 1s initial, 2x growth, 60s cap, full jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// 2 retries, 500ms initial, 10s cap. For callers waiting on a run.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            multiplier: 1.5,
            max_delay_ms: 10_000,
            ..Self::standard()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `attempt + 1` (0-indexed), capped and jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay().as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay().as_secs_f64());
        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> BackoffConfig {
        BackoffConfig {
            max_retries: 5,
            max_delay_ms: 5_000,
            jitter: JitterStrategy::None,
            ..BackoffConfig::standard()
        }
    }

    #[test]
    fn test_delay_grows_exponentially_until_cap() {
        let config = exact();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let full = BackoffConfig::standard();
        let equal = BackoffConfig {
            jitter: JitterStrategy::Equal,
            ..BackoffConfig::standard()
        };
        for _ in 0..100 {
            assert!(full.delay_for_attempt(1) <= Duration::from_secs(2));
            let d = equal.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"max_retries": 2, "jitter": "equal"}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.jitter, JitterStrategy::Equal);
        assert_eq!(config.initial_delay_ms, 1_000);
        assert!(config.retryable_statuses.contains(&503));
    }
}
