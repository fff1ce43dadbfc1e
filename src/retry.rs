//! Activity retry policy.
//!
//! The policy is recorded in the `ActivityScheduled` event, so a redeployment
//! that changes the code-level policy does not affect invocations already in
//! flight. Retries are evaluated by the activity worker pool, never by the
//! workflow: workflow code sees either the eventual result or one terminal
//! [`ActivityFailure`](crate::ActivityFailure).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between attempts of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let raw = base.as_nanos() as f64 * multiplier.powi(exp);
                if !raw.is_finite() || raw >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(raw.round() as u64)
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// How often, how patiently and for how long an activity is attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Upper bound for a single attempt; an attempt that runs longer counts as failed.
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            timeout: None,
            backoff: BackoffStrategy::default(),
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Whether another attempt follows the failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
