//! Ratekeeper - Distributed Rate Limiting Core
//!
//! This crate decides whether a request may proceed based on how many
//! requests the same identity has recently made under a named rule. Counters
//! live in a shared store (Redis in production, memory for tests and single
//! process deployments) so every process sees the same counts. Four
//! strategies are supported: fixed window, sliding window, token bucket and
//! leaky bucket.

pub mod clock;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod ratelimit;
pub mod store;
