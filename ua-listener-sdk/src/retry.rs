use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy with exponential backoff and an optional attempt limit.
///
/// Used by the listener's background reconnection loop. Both limits are
/// optional; when both are set, whichever is reached first stops retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (None = unlimited attempts)
    pub max_attempts: Option<u32>,

    /// Initial retry interval in milliseconds
    pub initial_interval_ms: u64,

    /// Maximum retry interval cap in milliseconds
    pub max_interval_ms: u64,

    /// Randomization factor in range [0.0, 1.0]. Example: 0.2 means ±20% jitter
    pub randomization_factor: f64,

    /// Multiplicative factor for each retry step. Typically 2.0 for exponential backoff
    pub multiplier: f64,

    /// Optional maximum total elapsed time in milliseconds (None = no time limit)
    pub max_elapsed_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl RetryPolicy {
    /// Retry forever. Reconnection after a lost session must never give up.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_elapsed_time_ms: None,
        }
    }

    /// Create a retry policy with specific max attempts
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::unlimited()
        }
    }

    /// Returns `true` once `attempt` (1-based) exceeds the configured limit.
    #[inline]
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }

    /// Upper bound used when the backoff iterator stops yielding delays.
    #[inline]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms))
    }
}

/// Build an ExponentialBackoff from RetryPolicy.
///
/// `max_elapsed_time` controls the time-based limit; callers check
/// `max_attempts` separately through [`RetryPolicy::exhausted`].
pub fn build_exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        max_interval: policy.max_interval(),
        randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
        multiplier: policy.multiplier.max(1.0),
        max_elapsed_time: policy.max_elapsed_time_ms.map(Duration::from_millis),
        ..ExponentialBackoff::default()
    }
}
