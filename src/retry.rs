//! Retry policy for backend calls
//!
//! A call is attempted at most `max_attempts` times. After the n-th failed
//! attempt the client waits `backoff_base * 2^n` before trying again, so the
//! defaults give waits of 2s and 4s. Every attempt is bounded by
//! `call_timeout`.

use std::time::Duration;

/// Attempt ceiling, backoff and per-attempt deadline for one backend client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Unit of the exponential backoff
    pub backoff_base: Duration,
    /// Deadline applied to each individual attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default deadline and backoff
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the backoff unit
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the per-attempt deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Wait before the next attempt, given how many attempts already failed.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts);
        self.backoff_base.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Upper bound on the time spent sleeping between attempts
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|n| self.backoff_for(n))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}
