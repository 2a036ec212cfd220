//! In-process counter store.
//!
//! Backs a single-node deployment and the test suite. Each key lives in one
//! `DashMap` shard, and every primitive runs while holding that shard's entry
//! lock, which gives the same per-key atomicity the Redis scripts provide.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{BucketState, CounterStore, StoreError, StoreResult, VersionedBucket, WindowLog};
use crate::clock::{Clock, SystemClock};

/// Write operations between two sweeps of expired records.
const SWEEP_INTERVAL: u64 = 256;

/// Stored value for a key.
#[derive(Debug, Clone)]
enum Record {
    Counter(u64),
    Log(VecDeque<f64>),
    Bucket(VersionedBucket),
}

#[derive(Debug, Clone)]
struct Slot {
    record: Record,
    expires_at: f64,
}

impl Slot {
    fn new(record: Record, now: f64, ttl_secs: u64) -> Self {
        Self {
            record,
            expires_at: now + ttl_secs as f64,
        }
    }

    fn is_expired(&self, now: f64) -> bool {
        self.expires_at <= now
    }
}

/// Counter store held in process memory.
pub struct MemoryStore {
    records: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create a store that expires records by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires records by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of records that have not expired yet.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.records.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired records and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            trace!(removed = removed, "Purged expired records");
        }
        removed
    }

    /// Purge once every `SWEEP_INTERVAL` writes. Must not be called while an
    /// entry guard is held.
    fn maybe_sweep(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_expired();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// Write primitives. Each holds one entry guard and drops it on return.
impl MemoryStore {
    fn increment_locked(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut slot = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Record::Counter(0), now, ttl_secs));

        if slot.is_expired(now) {
            *slot = Slot::new(Record::Counter(0), now, ttl_secs);
        }

        match &mut slot.record {
            Record::Counter(count) => {
                *count += 1;
                Ok(*count)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sliding_admit_locked(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
    ) -> StoreResult<WindowLog> {
        let clock_now = self.clock.now();
        let mut slot = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Record::Log(VecDeque::new()), clock_now, window_secs));

        if slot.is_expired(clock_now) {
            *slot = Slot::new(Record::Log(VecDeque::new()), clock_now, window_secs);
        }

        let cutoff = now - window_secs as f64;
        let log = match &mut slot.record {
            Record::Log(log) => log,
            _ => return Err(StoreError::WrongType(key.to_string())),
        };

        log.retain(|&ts| ts >= cutoff);
        let count = log.len() as u64;
        let admitted = count < limit;

        if admitted {
            let idx = log.partition_point(|&ts| ts <= now);
            log.insert(idx, now);
        }

        let oldest = log.front().copied();
        if admitted {
            slot.expires_at = clock_now + window_secs as f64;
        }

        Ok(WindowLog {
            count,
            admitted,
            oldest,
        })
    }

    fn swap_bucket_locked(
        &self,
        key: &str,
        expected_version: u64,
        state: BucketState,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Ok(false);
                }
                vacant.insert(Slot::new(
                    Record::Bucket(VersionedBucket { state, version: 1 }),
                    now,
                    ttl_secs,
                ));
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current_version = if slot.is_expired(now) {
                    0
                } else {
                    match &slot.record {
                        Record::Bucket(bucket) => bucket.version,
                        _ => return Err(StoreError::WrongType(key.to_string())),
                    }
                };

                if current_version != expected_version {
                    trace!(
                        key = %key,
                        expected = expected_version,
                        current = current_version,
                        "Bucket version moved"
                    );
                    return Ok(false);
                }

                *slot = Slot::new(
                    Record::Bucket(VersionedBucket {
                        state,
                        version: current_version + 1,
                    }),
                    now,
                    ttl_secs,
                );
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
        let result = self.increment_locked(key, ttl_secs);
        self.maybe_sweep();
        result
    }

    async fn sliding_admit(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
    ) -> StoreResult<WindowLog> {
        let result = self.sliding_admit_locked(key, now, window_secs, limit);
        self.maybe_sweep();
        result
    }

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<VersionedBucket>> {
        let now = self.clock.now();
        match self.records.get(key) {
            Some(slot) if !slot.is_expired(now) => match &slot.record {
                Record::Bucket(bucket) => Ok(Some(*bucket)),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected_version: u64,
        state: BucketState,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let result = self.swap_bucket_locked(key, expected_version, state, ttl_secs);
        self.maybe_sweep();
        result
    }
}
