use std::time::Duration;

use crate::errors::{ErrorClass, SyncError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// How calendar store operations are retried. Inspectable on purpose: the
/// publisher asks it what to do after each failure instead of hiding the
/// loop behind a wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub retryable: Vec<ErrorClass>,
    /// Classes after which the store session is thrown away and rebuilt.
    pub reconnect_on: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            retryable: vec![
                ErrorClass::Authorization,
                ErrorClass::Connection,
                ErrorClass::Remote,
            ],
            reconnect_on: vec![ErrorClass::Authorization, ErrorClass::Connection],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, optionally rebuild the session, then try again.
    Retry { delay: Duration, reconnect: bool },
    /// Hand the error to the caller.
    GiveUp,
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Delay after the `attempt`-th failure (1-based): `base * factor^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let seconds = self.base_delay.as_secs_f64() * factor;
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(seconds)
    }

    pub fn should_reconnect(&self, class: ErrorClass) -> bool {
        self.reconnect_on.contains(&class)
    }

    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        self.retryable.contains(&class)
    }

    /// What to do after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &SyncError) -> RetryDecision {
        let class = error.class();
        if attempt >= self.max_attempts || !self.is_retryable(class) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_after(attempt),
            reconnect: self.should_reconnect(class),
        }
    }
}
