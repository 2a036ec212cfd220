//! Wall-clock time sources.
//!
//! Rate limit state is shared between processes, so every timestamp is a
//! unix time rather than a monotonic instant.

use std::sync::Arc;

use parking_lot::RwLock;

/// Source of the current time in fractional unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.current.write() += secs;
    }

    pub fn set(&self, now: f64) {
        *self.current.write() = now;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.read()
    }
}
