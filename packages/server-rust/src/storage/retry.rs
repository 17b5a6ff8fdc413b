//! Retry budget and backoff shared by every transactional executor.

use std::time::Duration;

use rand::Rng;

/// How often, and how patiently, a unit of work is re-run after a transient
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries until success.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// A policy that re-runs immediately, for tests.
    #[must_use]
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the retry following the `failures`-th conflict.
    ///
    /// Exponential in `failures`, capped at `max_delay`, with the lower half
    /// randomized so that colliding transactions drift apart.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        let ceiling_us = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
        if ceiling_us == 0 {
            return Duration::ZERO;
        }
        let floor_us = ceiling_us / 2;
        Duration::from_micros(rand::rng().random_range(floor_us..=ceiling_us))
    }
}

/// Per-call retry state.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Transient failures recorded so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a transient failure and sleeps before the next attempt.
    ///
    /// Returns `false` without sleeping once the attempt budget is spent.
    pub async fn retry(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                return false;
            }
        }
        let delay = self.policy.delay_for(self.failures);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        true
    }
}
