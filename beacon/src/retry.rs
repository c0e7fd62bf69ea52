use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicyConfig;

/// Retry schedule for transient delivery failures: exponential backoff with
/// additive jitter so synchronized clients do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per batch, the initial send included.
    max_attempts: u32,
    base_interval: Duration,
    maximum_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration, maximum_interval: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based): base doubled per attempt, plus up to 50% jitter, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_interval
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        doubled
            .saturating_add(doubled.mul_f64(jitter))
            .min(self.maximum_interval)
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            config.base_interval.0,
            config.maximum_interval.0,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(30),
        }
    }
}
