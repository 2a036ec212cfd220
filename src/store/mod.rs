//! Shared counter store abstraction.
//!
//! The store is the single piece of shared mutable state behind every
//! rate limit decision. It exposes a handful of atomic primitives and knows
//! nothing about quotas: the strategy evaluators build their semantics on top
//! of these calls.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
///
/// Every variant is treated the same way by the rate limiter: the check
/// fails open.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Key {0} holds a record of a different kind")]
    WrongType(String),

    #[error("Bucket update for {key} conflicted {attempts} times")]
    Contention { key: String, attempts: u32 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of an atomic sliding-log admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLog {
    /// Entries inside the trailing window before this request was considered.
    pub count: u64,
    /// Whether the request timestamp was inserted.
    pub admitted: bool,
    /// Oldest timestamp still in the log after the operation.
    pub oldest: Option<f64>,
}

/// Persisted state of a token or leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens available (token bucket) or fill level (leaky bucket).
    pub value: f64,
    /// Unix seconds of the last refill or leak.
    pub updated_at: f64,
}

/// Bucket state together with the version used for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionedBucket {
    pub state: BucketState,
    /// Starts at 1 on first write; 0 is reserved for "absent".
    pub version: u64,
}

/// A shared key/value store offering the atomic primitives the strategies need.
///
/// Implementations must make each method linearizable per key. Keys are
/// opaque; implementations may namespace them.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Increment the counter at `key` and return the new value.
    ///
    /// The TTL is applied only when the increment creates the counter.
    async fn increment(&self, key: &str, ttl_secs: u64) -> StoreResult<u64>;

    /// Trim, count and conditionally append to the timestamp log at `key`.
    ///
    /// Entries older than `now - window_secs` are dropped. If fewer than
    /// `limit` remain, `now` is appended and the TTL is refreshed to
    /// `window_secs`. The whole sequence is one atomic step.
    async fn sliding_admit(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
    ) -> StoreResult<WindowLog>;

    /// Read the bucket at `key` along with its version.
    async fn load_bucket(&self, key: &str) -> StoreResult<Option<VersionedBucket>>;

    /// Write `state` only if the stored version still equals `expected_version`.
    ///
    /// Pass `0` to require that the bucket does not exist yet. Returns `false`
    /// when another writer got there first.
    async fn swap_bucket(
        &self,
        key: &str,
        expected_version: u64,
        state: BucketState,
        ttl_secs: u64,
    ) -> StoreResult<bool>;
}
