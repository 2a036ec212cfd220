//! HTTP-facing enforcement of rate limit decisions.

mod adapter;

pub use adapter::{
    translate, Admission, EnforcementAdapter, RateLimitMetadata, Rejection, HEADER_LIMIT,
    HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
