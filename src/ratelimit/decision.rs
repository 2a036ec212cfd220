//! Rate limit decisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of evaluating one request against one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured limit or bucket capacity
    pub limit: u64,
    /// Requests left before the rule starts denying
    pub remaining: u64,
    /// Unix seconds at which the caller should retry or the quota recovers
    pub reset_time: u64,
}

impl Decision {
    pub fn allow(limit: u64, remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_time,
        }
    }

    pub fn deny(limit: u64, reset_time: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time,
        }
    }

    /// Whole seconds until `reset_time`, never less than one.
    pub fn retry_after(&self, now: f64) -> u64 {
        let wait = (self.reset_time as f64 - now).ceil();
        if wait < 1.0 {
            1
        } else {
            wait as u64
        }
    }

    /// Orders decisions so that a denial beats an admission, and fewer
    /// remaining requests beat more.
    pub fn is_stricter_than(&self, other: &Decision) -> bool {
        match (self.allowed, other.allowed) {
            (false, true) => true,
            (true, false) => false,
            (false, false) => self.reset_time > other.reset_time,
            (true, true) => {
                self.remaining < other.remaining
                    || (self.remaining == other.remaining && self.reset_time > other.reset_time)
            }
        }
    }
}

/// Returned by [`RateLimiter::enforce`](super::RateLimiter::enforce) when the
/// quota for a rule is exhausted.
#[derive(Debug, Clone, Error)]
#[error("Rate limit exceeded for rule {rule}, retry after {retry_after}s")]
pub struct QuotaExceeded {
    /// The rule that denied the request
    pub rule: String,
    pub decision: Decision,
    pub retry_after: u64,
}

/// Round a fractional unix time up to whole seconds.
pub(crate) fn ceil_secs(t: f64) -> u64 {
    if t <= 0.0 {
        0
    } else {
        t.ceil() as u64
    }
}
