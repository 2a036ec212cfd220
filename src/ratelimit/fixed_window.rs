//! Fixed window evaluator.
//!
//! Counts requests in epoch-aligned buckets of `window_seconds`. A burst that
//! straddles a boundary can see up to twice the limit pass; callers that need
//! a strict trailing bound use the sliding window instead.

use tracing::trace;

use super::decision::Decision;
use crate::store::{CounterStore, StoreResult};

pub(crate) async fn evaluate(
    store: &dyn CounterStore,
    key: &str,
    limit: u64,
    window_seconds: u64,
    now: f64,
) -> StoreResult<Decision> {
    let window_index = (now / window_seconds as f64).floor() as u64;
    let counter_key = format!("{}:{}", key, window_index);

    let count = store.increment(&counter_key, window_seconds).await?;
    let reset_time = (window_index + 1) * window_seconds;

    trace!(key = %counter_key, count = count, limit = limit, "Fixed window counted");

    if count <= limit {
        Ok(Decision::allow(limit, limit - count, reset_time))
    } else {
        Ok(Decision::deny(limit, reset_time))
    }
}
