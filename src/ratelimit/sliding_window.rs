//! Sliding window (log) evaluator.
//!
//! Keeps one timestamp per admitted request. At any instant the log holds at
//! most `limit` entries inside the trailing window, so there is no boundary
//! doubling.

use tracing::trace;

use super::decision::{ceil_secs, Decision};
use crate::store::{CounterStore, StoreResult};

pub(crate) async fn evaluate(
    store: &dyn CounterStore,
    key: &str,
    limit: u64,
    window_seconds: u64,
    now: f64,
) -> StoreResult<Decision> {
    let log = store.sliding_admit(key, now, window_seconds, limit).await?;
    let window = window_seconds as f64;
    let reset_time = ceil_secs(log.oldest.unwrap_or(now) + window);

    trace!(
        key = %key,
        count = log.count,
        admitted = log.admitted,
        "Sliding window evaluated"
    );

    if log.admitted {
        Ok(Decision::allow(
            limit,
            limit.saturating_sub(log.count + 1),
            reset_time,
        ))
    } else {
        Ok(Decision::deny(limit, reset_time))
    }
}
