//! Strategy configuration and dispatch to the per-algorithm evaluators.

use serde::{Deserialize, Serialize};

use super::decision::Decision;
use super::{bucket, fixed_window, sliding_window};
use crate::error::{RatekeeperError, Result};
use crate::store::{CounterStore, StoreResult};

/// Default bound on compare-and-swap attempts for bucket strategies.
pub const DEFAULT_CAS_MAX_RETRIES: u32 = 16;

/// A quota algorithm together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Counter per epoch-aligned window
    FixedWindow { limit: u64, window_seconds: u64 },
    /// Timestamp log over a trailing window
    SlidingWindow { limit: u64, window_seconds: u64 },
    /// Bucket that refills continuously; each request takes a token
    TokenBucket { capacity: u64, refill_per_second: f64 },
    /// Bucket that drains continuously; each request adds a unit
    LeakyBucket { capacity: u64, leak_per_second: f64 },
}

impl StrategyConfig {
    /// Check the parameter invariants.
    pub fn validate(&self) -> Result<()> {
        let limit_ok = self.limit() >= 1;
        let shape_ok = match *self {
            StrategyConfig::FixedWindow { window_seconds, .. }
            | StrategyConfig::SlidingWindow { window_seconds, .. } => window_seconds > 0,
            StrategyConfig::TokenBucket {
                refill_per_second: rate,
                ..
            }
            | StrategyConfig::LeakyBucket {
                leak_per_second: rate,
                ..
            } => rate.is_finite() && rate > 0.0,
        };

        if !limit_ok {
            return Err(RatekeeperError::Config(format!(
                "{} limit must be at least 1",
                self.kind()
            )));
        }
        if !shape_ok {
            return Err(RatekeeperError::Config(format!(
                "{} window or rate must be positive",
                self.kind()
            )));
        }
        Ok(())
    }

    /// Limit or capacity reported to callers.
    pub fn limit(&self) -> u64 {
        match *self {
            StrategyConfig::FixedWindow { limit, .. }
            | StrategyConfig::SlidingWindow { limit, .. } => limit,
            StrategyConfig::TokenBucket { capacity, .. }
            | StrategyConfig::LeakyBucket { capacity, .. } => capacity,
        }
    }

    /// Window length, or the time an empty/full bucket needs to fully recover.
    ///
    /// Used as the record TTL and as the fail-open reset horizon.
    pub fn horizon_seconds(&self) -> u64 {
        match *self {
            StrategyConfig::FixedWindow { window_seconds, .. }
            | StrategyConfig::SlidingWindow { window_seconds, .. } => window_seconds,
            StrategyConfig::TokenBucket {
                capacity,
                refill_per_second: rate,
            }
            | StrategyConfig::LeakyBucket {
                capacity,
                leak_per_second: rate,
            } => recovery_horizon(capacity, rate),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::FixedWindow { .. } => "fixed_window",
            StrategyConfig::SlidingWindow { .. } => "sliding_window",
            StrategyConfig::TokenBucket { .. } => "token_bucket",
            StrategyConfig::LeakyBucket { .. } => "leaky_bucket",
        }
    }
}

/// Seconds for a bucket of `capacity` to fully refill or drain at `rate`.
pub(crate) fn recovery_horizon(capacity: u64, rate: f64) -> u64 {
    ((capacity as f64 / rate).ceil() as u64).max(1)
}

/// Runs a strategy against a counter store.
pub struct Evaluator<'a> {
    store: &'a dyn CounterStore,
    cas_max_retries: u32,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn CounterStore) -> Self {
        Self {
            store,
            cas_max_retries: DEFAULT_CAS_MAX_RETRIES,
        }
    }

    pub fn with_cas_max_retries(mut self, retries: u32) -> Self {
        self.cas_max_retries = retries;
        self
    }

    /// Evaluate one request for `key` at unix time `now`.
    ///
    /// Only store faults are returned as errors; an exhausted quota is a
    /// denied [`Decision`].
    pub async fn evaluate(
        &self,
        key: &str,
        config: &StrategyConfig,
        now: f64,
    ) -> StoreResult<Decision> {
        match *config {
            StrategyConfig::FixedWindow {
                limit,
                window_seconds,
            } => fixed_window::evaluate(self.store, key, limit, window_seconds, now).await,
            StrategyConfig::SlidingWindow {
                limit,
                window_seconds,
            } => sliding_window::evaluate(self.store, key, limit, window_seconds, now).await,
            StrategyConfig::TokenBucket {
                capacity,
                refill_per_second,
            } => {
                bucket::evaluate_token(
                    self.store,
                    key,
                    capacity,
                    refill_per_second,
                    now,
                    self.cas_max_retries,
                )
                .await
            }
            StrategyConfig::LeakyBucket {
                capacity,
                leak_per_second,
            } => {
                bucket::evaluate_leaky(
                    self.store,
                    key,
                    capacity,
                    leak_per_second,
                    now,
                    self.cas_max_retries,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config = StrategyConfig::FixedWindow {
            limit: 0,
            window_seconds: 60,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window_and_bad_rates() {
        let zero_window = StrategyConfig::SlidingWindow {
            limit: 10,
            window_seconds: 0,
        };
        let negative_rate = StrategyConfig::TokenBucket {
            capacity: 10,
            refill_per_second: -1.0,
        };
        let nan_rate = StrategyConfig::LeakyBucket {
            capacity: 10,
            leak_per_second: f64::NAN,
        };

        assert!(zero_window.validate().is_err());
        assert!(negative_rate.validate().is_err());
        assert!(nan_rate.validate().is_err());
    }

    #[test]
    fn test_horizon_seconds() {
        let fixed = StrategyConfig::FixedWindow {
            limit: 5,
            window_seconds: 300,
        };
        let token = StrategyConfig::TokenBucket {
            capacity: 50,
            refill_per_second: 1.0 / 50.0,
        };
        let leaky = StrategyConfig::LeakyBucket {
            capacity: 3,
            leak_per_second: 4.0,
        };

        assert_eq!(fixed.horizon_seconds(), 300);
        assert_eq!(token.horizon_seconds(), 2500);
        assert_eq!(recovery_horizon(50, 1.0 / 50.0), token.horizon_seconds());
        assert_eq!(leaky.horizon_seconds(), 1);
    }

    #[test]
    fn test_strategy_config_yaml_shape() {
        let yaml = r#"
strategy: token_bucket
capacity: 50
refill_per_second: 0.02
"#;
        let config: StrategyConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config,
            StrategyConfig::TokenBucket {
                capacity: 50,
                refill_per_second: 0.02
            }
        );
        assert_eq!(config.kind(), "token_bucket");
    }

    #[tokio::test]
    async fn test_first_request_is_allowed_under_every_strategy() {
        let clock = ManualClock::new(1_000.0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let evaluator = Evaluator::new(&store);

        let configs = [
            StrategyConfig::FixedWindow {
                limit: 1,
                window_seconds: 60,
            },
            StrategyConfig::SlidingWindow {
                limit: 1,
                window_seconds: 60,
            },
            StrategyConfig::TokenBucket {
                capacity: 1,
                refill_per_second: 0.5,
            },
            StrategyConfig::LeakyBucket {
                capacity: 1,
                leak_per_second: 0.5,
            },
        ];

        for config in configs {
            let key = format!("first:{}", config.kind());
            let decision = evaluator.evaluate(&key, &config, clock.now()).await.unwrap();
            assert!(decision.allowed, "{} must allow a fresh key", config.kind());
            assert_eq!(decision.limit, 1);
            assert_eq!(decision.remaining, 0);
        }
    }
}
