//! Node retry policy
//!
//! A policy answers two questions about a failed node: may it run again, and
//! how long must it wait first. The same type drives queue redelivery backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// What to do with a failed node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`; `retry_count` is the new count to persist
    Retry { retry_count: u32, delay: Duration },

    /// Retry budget exhausted or error not retryable
    GiveUp,
}

/// Bounded retry with capped exponential backoff
///
/// `max_retries` counts retries, not attempts: with `max_retries = 3` a node
/// runs at most four times and the fourth failure is final.
///
/// ```
/// use blockflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// // 2s, 4s, 8s, then 10s for every later retry
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_secs(2))
///     .with_max_interval(Duration::from_secs(10))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(8));
/// assert_eq!(policy.delay_for_retry(5), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,

    /// Wait before the first retry
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub initial_interval: Duration,

    /// Ceiling on any single wait
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive waits
    pub multiplier: f64,

    /// Fraction of each wait that is randomised, 0.0 to 1.0
    pub jitter: f64,

    /// Circuit short-circuits absorbed without consuming retry budget
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

fn default_max_deferrals() -> u32 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Three retries starting at one second, doubling up to a minute, ±10%
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_deferrals: default_max_deferrals(),
        }
    }

    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 0)
    }

    /// Same wait before every retry
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: 0.0,
            max_deferrals: default_max_deferrals(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, delay: Duration) -> Self {
        self.initial_interval = delay;
        self
    }

    pub fn with_max_interval(mut self, ceiling: Duration) -> Self {
        self.max_interval = ceiling;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Clamped to 0.0..=1.0
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_deferrals(mut self, max_deferrals: u32) -> Self {
        self.max_deferrals = max_deferrals;
        self
    }

    /// Wait before retry number `retry` (1-based); zero for `retry == 0`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let secs = (self.initial_interval.as_secs_f64() * growth).min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(spread(secs, self.jitter))
    }

    /// Decide the fate of a node that failed after `retry_count` retries
    pub fn decide(&self, retry_count: u32, retryable: bool) -> RetryDecision {
        if !retryable || retry_count >= self.max_retries {
            return RetryDecision::GiveUp;
        }

        let next = retry_count + 1;
        RetryDecision::Retry {
            retry_count: next,
            delay: self.delay_for_retry(next),
        }
    }

    /// Whether a short-circuit may be deferred instead of consuming a retry
    pub fn can_defer(&self, deferral_count: u32) -> bool {
        deferral_count < self.max_deferrals
    }
}

/// Randomise `secs` by up to `fraction` in either direction
fn spread(secs: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 || secs <= 0.0 || !secs.is_finite() {
        return secs.max(0.0);
    }
    let span = secs * fraction;
    rand::thread_rng().gen_range(secs - span..=secs + span).max(0.0)
}
