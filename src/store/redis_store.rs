//! Redis-backed counter store.
//!
//! Every primitive is a single Lua script so the read-modify-write happens
//! server side in one round trip. Connections are established lazily and
//! shared through a `ConnectionManager`, which reconnects on its own after
//! a failure.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BucketState, CounterStore, StoreResult, VersionedBucket, WindowLog};

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

const SLIDING_ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[2])
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
    redis.call('ZADD', key, ARGV[1], ARGV[5])
    redis.call('EXPIRE', key, ARGV[3])
    admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = ''
if oldest[2] then
    oldest_score = oldest[2]
end
return {count, admitted, oldest_score}
"#;

const SWAP_BUCKET_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'ver') or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('HSET', KEYS[1], 'value', ARGV[2], 'ts', ARGV[3], 'ver', current + 1)
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

/// Counter store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    increment_script: Script,
    sliding_script: Script,
    swap_script: Script,
}

impl RedisStore {
    /// Create a store for the given Redis URL.
    ///
    /// No connection is made until the first call.
    pub fn open(url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let key_prefix = key_prefix.into();
        info!(url = %url, key_prefix = %key_prefix, "Configured Redis counter store");

        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix,
            increment_script: Script::new(INCREMENT_SCRIPT),
            sliding_script: Script::new(SLIDING_ADMIT_SCRIPT),
            swap_script: Script::new(SWAP_BUCKET_SCRIPT),
        })
    }

    /// Prefix applied to every key written by this store.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = self
            .increment_script
            .key(self.namespaced(key))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn sliding_admit(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
    ) -> StoreResult<WindowLog> {
        let mut conn = self.connection().await?;
        // Members must be unique or two requests in the same microsecond collapse into one.
        let member = format!("{}-{}", now, uuid::Uuid::new_v4());

        let (count, admitted, oldest): (u64, i64, String) = self
            .sliding_script
            .key(self.namespaced(key))
            .arg(now)
            .arg(now - window_secs as f64)
            .arg(window_secs)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowLog {
            count,
            admitted: admitted == 1,
            oldest: oldest.parse::<f64>().ok(),
        })
    }

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<VersionedBucket>> {
        let mut conn = self.connection().await?;
        let (value, updated_at, version): (Option<f64>, Option<f64>, Option<u64>) =
            redis::cmd("HMGET")
                .arg(self.namespaced(key))
                .arg("value")
                .arg("ts")
                .arg("ver")
                .query_async(&mut conn)
                .await?;

        Ok(match (value, updated_at, version) {
            (Some(value), Some(updated_at), Some(version)) => Some(VersionedBucket {
                state: BucketState { value, updated_at },
                version,
            }),
            _ => None,
        })
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected_version: u64,
        state: BucketState,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let swapped: i64 = self
            .swap_script
            .key(self.namespaced(key))
            .arg(expected_version)
            .arg(state.value)
            .arg(state.updated_at)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
