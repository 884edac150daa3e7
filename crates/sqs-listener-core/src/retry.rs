//! # Retry Policy Module
//!
//! Exponential backoff for backend calls. The poller retries receive failures
//! without limit; the acknowledgement coordinator retries deletes a bounded
//! number of times before giving up on a batch.

use rand::Rng;
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth factor applied per retry
    pub backoff_multiplier: f64,

    /// Random variation as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::acknowledgement()
    }
}

impl RetryPolicy {
    /// Policy for receive failures: unbounded, capped at 10 seconds
    pub fn polling() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_percent: 0.25,
        }
    }

    /// Policy for delete failures: five retries, capped at 5 seconds
    pub fn acknowledgement() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_percent: 0.25,
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disable jitter, mostly useful for deterministic tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter_percent = 0.0;
        self
    }

    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based): `initial * multiplier^retry`,
    /// capped at `max_delay`, then jittered
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_percent > 0.0 && capped > 0.0 {
            let range = capped * self.jitter_percent;
            capped + rand::rng().random_range(-range..=range)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Whether retry number `retry` (0-based) is still allowed
    pub fn allows_retry(&self, retry: u32) -> bool {
        self.max_retries.is_none_or(|max| retry < max)
    }

    /// Start tracking a new sequence of attempts
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// Attempt counter for one sequence of retries
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    /// Retries taken so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next retry, or `None` once the policy is exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.allows_retry(self.retries) {
            return None;
        }

        let delay = self.policy.delay_for(self.retries);
        self.retries = self.retries.saturating_add(1);
        Some(delay)
    }

    /// Forget earlier failures after a successful call
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}
