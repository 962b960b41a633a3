//! Bounded retry state for AI calls.
//!
//! Transient failures (`Unavailable`, `Timeout`) and rate limiting draw on
//! separate budgets: a service that keeps telling us to slow down should not
//! exhaust the retries reserved for outages, and vice versa.

use std::time::Duration;

use crate::error::ExternalServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after `Unavailable`/`Timeout`.
    pub max_retries: u32,
    /// Waits after `RateLimited`.
    pub max_rate_limit_waits: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_rate_limit_waits: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt: base, 2×base, 4×base, ... capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    Transient,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, kind: RetryKind },
    GiveUp,
}

/// Attempt counters for one logical AI call (including its retries).
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    retries: u32,
    rate_limit_waits: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: 0,
            rate_limit_waits: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn rate_limit_waits(&self) -> u32 {
        self.rate_limit_waits
    }

    /// Record a failure and decide whether to try again, and after how long.
    pub fn decide(&mut self, err: &ExternalServiceError) -> RetryDecision {
        match err {
            ExternalServiceError::RateLimited { retry_after } => {
                if self.rate_limit_waits >= self.policy.max_rate_limit_waits {
                    return RetryDecision::GiveUp;
                }
                self.rate_limit_waits += 1;
                let delay = retry_after
                    .unwrap_or_else(|| self.policy.backoff_delay(self.rate_limit_waits));
                RetryDecision::Retry {
                    delay,
                    kind: RetryKind::RateLimited,
                }
            }
            ExternalServiceError::Unavailable(_) | ExternalServiceError::Timeout(_) => {
                if self.retries >= self.policy.max_retries {
                    return RetryDecision::GiveUp;
                }
                self.retries += 1;
                RetryDecision::Retry {
                    delay: self.policy.backoff_delay(self.retries),
                    kind: RetryKind::Transient,
                }
            }
            ExternalServiceError::Rejected(_) => RetryDecision::GiveUp,
        }
    }
}
