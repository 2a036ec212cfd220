//! Token bucket and leaky bucket evaluators.
//!
//! Both keep a `{value, updated_at}` pair in the store. The new state depends
//! on the old one, so each evaluation is an optimistic compare-and-swap loop:
//! load the versioned state, compute the next state locally, and write it
//! only if nobody else has written in between.

use tracing::trace;

use super::decision::{ceil_secs, Decision};
use super::strategy::recovery_horizon;
use crate::store::{BucketState, CounterStore, StoreError, StoreResult};

/// Apply `step` to the bucket at `key` atomically.
///
/// `step` receives the current state (or `None` for a fresh key) and returns
/// the state to persist plus whether the request is admitted. It may run more
/// than once when writers race.
async fn update<F>(
    store: &dyn CounterStore,
    key: &str,
    ttl_secs: u64,
    max_retries: u32,
    mut step: F,
) -> StoreResult<(BucketState, bool)>
where
    F: FnMut(Option<BucketState>) -> (BucketState, bool),
{
    let attempts = max_retries.saturating_add(1);

    for attempt in 1..=attempts {
        let current = store.load_bucket(key).await?;
        let expected_version = current.map_or(0, |bucket| bucket.version);
        let (next, admitted) = step(current.map(|bucket| bucket.state));

        if store
            .swap_bucket(key, expected_version, next, ttl_secs)
            .await?
        {
            return Ok((next, admitted));
        }

        trace!(
            key = %key,
            attempt = attempt,
            version = expected_version,
            "Bucket update conflicted, retrying"
        );
        tokio::task::yield_now().await;
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts,
    })
}

pub(crate) async fn evaluate_token(
    store: &dyn CounterStore,
    key: &str,
    capacity: u64,
    refill_per_second: f64,
    now: f64,
    max_retries: u32,
) -> StoreResult<Decision> {
    let cap = capacity as f64;

    let (state, admitted) = update(
        store,
        key,
        recovery_horizon(capacity, refill_per_second),
        max_retries,
        |current| {
            let (tokens, last_refill) =
                current.map_or((cap, now), |state| (state.value, state.updated_at));
            let elapsed = (now - last_refill).max(0.0);
            let mut tokens = (tokens + elapsed * refill_per_second).min(cap);

            let admitted = tokens >= 1.0;
            if admitted {
                tokens -= 1.0;
            }

            let next = BucketState {
                value: tokens,
                updated_at: now.max(last_refill),
            };
            (next, admitted)
        },
    )
    .await?;

    let tokens = state.value;
    if admitted {
        let reset_time = ceil_secs(now + (cap - tokens) / refill_per_second);
        Ok(Decision::allow(capacity, tokens.floor() as u64, reset_time))
    } else {
        let reset_time = ceil_secs(now + (1.0 - tokens) / refill_per_second);
        Ok(Decision::deny(capacity, reset_time))
    }
}

pub(crate) async fn evaluate_leaky(
    store: &dyn CounterStore,
    key: &str,
    capacity: u64,
    leak_per_second: f64,
    now: f64,
    max_retries: u32,
) -> StoreResult<Decision> {
    let cap = capacity as f64;

    let (state, admitted) = update(
        store,
        key,
        recovery_horizon(capacity, leak_per_second),
        max_retries,
        |current| {
            let (level, last_leak) =
                current.map_or((0.0, now), |state| (state.value, state.updated_at));
            let elapsed = (now - last_leak).max(0.0);
            let mut level = (level - elapsed * leak_per_second).max(0.0);

            // Keeps level within [0, capacity].
            let admitted = level + 1.0 <= cap;
            if admitted {
                level += 1.0;
            }

            let next = BucketState {
                value: level,
                updated_at: now.max(last_leak),
            };
            (next, admitted)
        },
    )
    .await?;

    let level = state.value;
    let reset_time = ceil_secs(now + level / leak_per_second);
    if admitted {
        let remaining = (cap - level).max(0.0).floor() as u64;
        Ok(Decision::allow(capacity, remaining, reset_time))
    } else {
        Ok(Decision::deny(capacity, reset_time))
    }
}
