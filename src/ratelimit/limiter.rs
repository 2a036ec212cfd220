//! Rate limiter coordinator.
//!
//! Resolves the rule, derives the counter key, runs the strategy against the
//! shared store and returns a [`Decision`]. Store failures never reach the
//! caller: the limiter fails open and records the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, trace, warn};

use super::catalog::{RuleBinding, StrategyCatalog, DEFAULT_RULE};
use super::decision::{ceil_secs, Decision, QuotaExceeded};
use super::key::{IdentityContext, RateLimitKey};
use super::strategy::{Evaluator, DEFAULT_CAS_MAX_RETRIES};
use crate::clock::{Clock, SystemClock};
use crate::store::{CounterStore, StoreError};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// The rate limiter shared by every request handler in a process.
///
/// Construct it once at startup and hand it out behind an `Arc`.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    catalog: StrategyCatalog,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    cas_max_retries: u32,
    fail_open_total: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn CounterStore>, catalog: StrategyCatalog) -> Self {
        Self {
            store,
            catalog,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cas_max_retries: DEFAULT_CAS_MAX_RETRIES,
            fail_open_total: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_cas_max_retries(mut self, retries: u32) -> Self {
        self.cas_max_retries = retries;
        self
    }

    /// Decide whether `identity` may perform one request under `rule`.
    ///
    /// `rule` is a rule name or a request path. Unknown inputs use the
    /// `default` rule.
    pub async fn check(&self, identity: &IdentityContext, rule: &str) -> Decision {
        let binding = self.catalog.resolve(rule);
        self.evaluate_binding(identity, binding).await
    }

    /// Like [`check`](Self::check), but a denial is returned as an error.
    pub async fn enforce(
        &self,
        identity: &IdentityContext,
        rule: &str,
    ) -> Result<Decision, QuotaExceeded> {
        let binding = self.catalog.resolve(rule);
        let decision = self.evaluate_binding(identity, binding).await;

        if decision.allowed {
            Ok(decision)
        } else {
            Err(QuotaExceeded {
                rule: binding.name.clone(),
                decision,
                retry_after: decision.retry_after(self.clock.now()),
            })
        }
    }

    /// Evaluate several rules for one request and return the strictest outcome.
    ///
    /// Every rule is counted, even when an earlier one already denies.
    pub async fn check_all(&self, identity: &IdentityContext, rules: &[&str]) -> Decision {
        if rules.is_empty() {
            return self.check(identity, DEFAULT_RULE).await;
        }

        let decisions = join_all(rules.iter().map(|rule| self.check(identity, rule))).await;

        decisions
            .into_iter()
            .reduce(|strictest, next| {
                if next.is_stricter_than(&strictest) {
                    next
                } else {
                    strictest
                }
            })
            .unwrap_or_else(|| Decision::allow(0, 0, 0))
    }

    async fn evaluate_binding(&self, identity: &IdentityContext, binding: &RuleBinding) -> Decision {
        let key = RateLimitKey::derive(identity, &binding.name).to_string_key();
        let now = self.clock.now();
        let evaluator =
            Evaluator::new(self.store.as_ref()).with_cas_max_retries(self.cas_max_retries);

        trace!(
            rule = %binding.name,
            key = %key,
            strategy = binding.strategy.kind(),
            "Checking rate limit"
        );

        let outcome = tokio::time::timeout(
            self.store_timeout,
            evaluator.evaluate(&key, &binding.strategy, now),
        )
        .await;

        match outcome {
            Ok(Ok(decision)) => {
                if !decision.allowed {
                    debug!(
                        rule = %binding.name,
                        key = %key,
                        limit = decision.limit,
                        reset_time = decision.reset_time,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Ok(Err(err)) => self.fail_open(binding, &key, now, &err),
            Err(_) => self.fail_open(binding, &key, now, &StoreError::Timeout(self.store_timeout)),
        }
    }

    fn fail_open(&self, binding: &RuleBinding, key: &str, now: f64, err: &StoreError) -> Decision {
        self.fail_open_total.fetch_add(1, Ordering::Relaxed);
        warn!(
            rule = %binding.name,
            key = %key,
            store = self.store.name(),
            error = %err,
            "Counter store unavailable, allowing request"
        );

        let limit = binding.strategy.limit();
        Decision::allow(
            limit,
            limit.saturating_sub(1),
            ceil_secs(now + binding.strategy.horizon_seconds() as f64),
        )
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of checks that failed open since startup.
    pub fn fail_open_total(&self) -> u64 {
        self.fail_open_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::clock::ManualClock;
    use crate::ratelimit::strategy::StrategyConfig;
    use crate::store::{BucketState, MemoryStore, StoreResult, VersionedBucket, WindowLog};

    const T0: f64 = 1_700_000_000.0;

    /// Memory store that can be switched into an outage.
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn new(clock: ManualClock) -> Self {
            Self {
                inner: MemoryStore::with_clock(Arc::new(clock)),
                down: AtomicBool::new(false),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check_up(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn increment(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
            self.check_up()?;
            self.inner.increment(key, ttl_secs).await
        }

        async fn sliding_admit(
            &self,
            key: &str,
            now: f64,
            window_secs: u64,
            limit: u64,
        ) -> StoreResult<WindowLog> {
            self.check_up()?;
            self.inner.sliding_admit(key, now, window_secs, limit).await
        }

        async fn load_bucket(&self, key: &str) -> StoreResult<Option<VersionedBucket>> {
            self.check_up()?;
            self.inner.load_bucket(key).await
        }

        async fn swap_bucket(
            &self,
            key: &str,
            expected_version: u64,
            state: BucketState,
            ttl_secs: u64,
        ) -> StoreResult<bool> {
            self.check_up()?;
            self.inner.swap_bucket(key, expected_version, state, ttl_secs).await
        }
    }

    /// Store that never answers.
    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn increment(&self, _key: &str, _ttl_secs: u64) -> StoreResult<u64> {
            futures::future::pending().await
        }

        async fn sliding_admit(
            &self,
            _key: &str,
            _now: f64,
            _window_secs: u64,
            _limit: u64,
        ) -> StoreResult<WindowLog> {
            futures::future::pending().await
        }

        async fn load_bucket(&self, _key: &str) -> StoreResult<Option<VersionedBucket>> {
            futures::future::pending().await
        }

        async fn swap_bucket(
            &self,
            _key: &str,
            _expected_version: u64,
            _state: BucketState,
            _ttl_secs: u64,
        ) -> StoreResult<bool> {
            futures::future::pending().await
        }
    }

    fn limiter_with(store: Arc<dyn CounterStore>, clock: &ManualClock) -> RateLimiter {
        RateLimiter::new(store, StrategyCatalog::builtin().unwrap())
            .with_clock(Arc::new(clock.clone()))
    }

    fn memory_limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (limiter_with(store, &clock), clock)
    }

    #[tokio::test]
    async fn test_unregistered_rule_uses_default() {
        let (limiter, _clock) = memory_limiter();
        let identity = IdentityContext::from_ip("203.0.113.9");

        let decision = limiter.check(&identity, "unregistered_rule").await;

        assert!(decision.allowed);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.remaining, 999);
    }

    #[tokio::test]
    async fn test_login_limit_by_ip() {
        let (limiter, clock) = memory_limiter();
        let identity = IdentityContext::from_ip("198.51.100.4").with_user("u1");

        for expected in (0..5).rev() {
            let decision = limiter.check(&identity, "auth_login").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        clock.advance(10.0);
        let decision = limiter.check(&identity, "auth_login").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // A different address has its own counter.
        let other = IdentityContext::from_ip("198.51.100.5");
        assert!(limiter.check(&other, "auth_login").await.allowed);
    }

    #[tokio::test]
    async fn test_path_resolution_reaches_bound_rule() {
        let (limiter, _clock) = memory_limiter();
        let identity = IdentityContext::from_ip("192.0.2.1");

        let decision = limiter.check(&identity, "/api/contact/send").await;

        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 2);
        assert_eq!(limiter.check(&identity, "contact_form").await.remaining, 1);
    }

    #[tokio::test]
    async fn test_unbound_api_path_is_counted_per_ip() {
        let (limiter, _clock) = memory_limiter();
        let noisy = IdentityContext::from_ip("10.0.0.1");

        for _ in 0..1000 {
            limiter.check(&noisy, "/api/invoices").await;
        }
        assert!(!limiter.check(&noisy, "/api/invoices").await.allowed);

        let other = IdentityContext::from_ip("10.9.9.9").with_user("u2");
        let decision = limiter.check(&other, "/api/invoices/42").await;

        assert!(decision.allowed);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.remaining, 999);
    }

    #[tokio::test]
    async fn test_outage_mid_burst_fails_open() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FlakyStore::new(clock.clone()));
        let limiter = limiter_with(store.clone(), &clock);
        let identity = IdentityContext::from_ip("192.0.2.50");

        for _ in 0..5 {
            assert!(limiter.check(&identity, "auth_login").await.allowed);
        }
        assert!(!limiter.check(&identity, "auth_login").await.allowed);

        store.set_down(true);
        let decision = limiter.check(&identity, "auth_login").await;

        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_time, T0 as u64 + 300);
        assert_eq!(limiter.fail_open_total(), 1);

        // Back up: enforcement resumes from the stored count.
        store.set_down(false);
        assert!(!limiter.check(&identity, "auth_login").await.allowed);
        assert_eq!(limiter.fail_open_total(), 1);
    }

    #[tokio::test]
    async fn test_outage_fails_open_for_every_strategy() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FlakyStore::new(clock.clone()));
        store.set_down(true);
        let limiter = limiter_with(store, &clock);
        let identity = IdentityContext::from_ip("192.0.2.60").with_user("9");

        for rule in ["auth_login", "erp_sync", "ocr_processing", "user_api"] {
            assert!(limiter.check(&identity, rule).await.allowed);
        }
        assert_eq!(limiter.fail_open_total(), 4);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_and_fails_open() {
        let clock = ManualClock::new(T0);
        let limiter = limiter_with(Arc::new(HangingStore), &clock)
            .with_store_timeout(Duration::from_millis(20));
        let identity = IdentityContext::from_ip("192.0.2.70");

        let decision = limiter.check(&identity, "ocr_processing").await;

        assert!(decision.allowed);
        assert_eq!(decision.limit, 50);
        assert_eq!(decision.remaining, 49);
        assert_eq!(decision.reset_time, T0 as u64 + 2500);
        assert_eq!(limiter.fail_open_total(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(crate::store::RedisStore::open("redis://127.0.0.1:1/", "t:").unwrap());
        let limiter = limiter_with(store, &clock).with_store_timeout(Duration::from_millis(200));
        let identity = IdentityContext::from_ip("192.0.2.80");

        let decision = limiter.check(&identity, "auth_login").await;

        assert!(decision.allowed);
        assert_eq!(limiter.fail_open_total(), 1);
    }

    #[tokio::test]
    async fn test_enforce_returns_quota_exceeded() {
        let (limiter, clock) = memory_limiter();
        let identity = IdentityContext::from_ip("192.0.2.90");

        for _ in 0..3 {
            assert_ok!(limiter.enforce(&identity, "contact_form").await);
        }

        clock.advance(600.0);
        let err = assert_err!(limiter.enforce(&identity, "contact_form").await);
        assert_eq!(err.rule, "contact_form");
        assert!(!err.decision.allowed);

        let window_end = ((T0 / 3600.0).floor() as u64 + 1) * 3600;
        assert_eq!(err.decision.reset_time, window_end);
        assert_eq!(err.retry_after, window_end - (T0 as u64 + 600));
    }

    #[tokio::test]
    async fn test_check_all_returns_strictest() {
        let (limiter, _clock) = memory_limiter();
        let identity = IdentityContext::from_ip("192.0.2.100");

        let first = limiter
            .check_all(&identity, &["contact_form", "contact_form_daily"])
            .await;
        assert!(first.allowed);
        assert_eq!(first.limit, 3);
        assert_eq!(first.remaining, 2);

        for _ in 0..2 {
            limiter
                .check_all(&identity, &["contact_form", "contact_form_daily"])
                .await;
        }
        let denied = limiter
            .check_all(&identity, &["contact_form", "contact_form_daily"])
            .await;
        assert!(!denied.allowed);

        // The daily counter still saw every attempt.
        let daily = limiter.check(&identity, "contact_form_daily").await;
        assert_eq!(daily.remaining, 10 - 5);
    }

    #[tokio::test]
    async fn test_check_all_with_no_rules_uses_default() {
        let (limiter, _clock) = memory_limiter();

        let decision = limiter.check_all(&IdentityContext::from_ip("192.0.2.1"), &[]).await;

        assert_eq!(decision.limit, 1000);
    }

    #[tokio::test]
    async fn test_custom_catalog_leaky_bucket() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let catalog = StrategyCatalog::new(vec![RuleBinding::new(
            "webhooks",
            StrategyConfig::LeakyBucket {
                capacity: 10,
                leak_per_second: 1.0,
            },
        )])
        .unwrap();
        let limiter = RateLimiter::new(store, catalog).with_clock(Arc::new(clock.clone()));
        let identity = IdentityContext::from_ip("192.0.2.7");

        for _ in 0..10 {
            assert!(limiter.check(&identity, "webhooks").await.allowed);
        }
        assert!(!limiter.check(&identity, "webhooks").await.allowed);

        clock.advance(1.0);
        assert!(limiter.check(&identity, "webhooks").await.allowed);
    }
}
