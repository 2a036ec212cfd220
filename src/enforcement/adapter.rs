//! Pre-handler hook that turns decisions into admissions or 429 responses.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::ratelimit::{Decision, IdentityContext, QuotaExceeded, RateLimiter};

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const HEADER_RETRY_AFTER: HeaderName = RETRY_AFTER;

/// Quota figures reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitMetadata {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
}

impl RateLimitMetadata {
    /// Write the `X-RateLimit-*` headers, replacing any existing values.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset_time));
    }
}

impl From<&Decision> for RateLimitMetadata {
    fn from(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_time: decision.reset_time,
        }
    }
}

/// The request may proceed. Attach the metadata to the outgoing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub metadata: RateLimitMetadata,
}

impl Admission {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        self.metadata.apply_headers(headers);
    }
}

/// The request must be rejected with HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Too many requests for rule {rule}, retry after {retry_after}s")]
pub struct Rejection {
    pub rule: String,
    pub metadata: RateLimitMetadata,
    pub retry_after: u64,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Rate limit headers plus `Retry-After`.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.metadata.apply_headers(&mut headers);
        headers.insert(HEADER_RETRY_AFTER, HeaderValue::from(self.retry_after));
        headers
    }

    fn body(&self) -> serde_json::Value {
        let reset_at = DateTime::<Utc>::from_timestamp(self.metadata.reset_time as i64, 0)
            .map(|at| at.to_rfc3339());

        serde_json::json!({
            "error": {
                "code": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests. Please slow down.",
                "rule": self.rule,
                "limit": self.metadata.limit,
                "remaining": self.metadata.remaining,
                "reset_time": self.metadata.reset_time,
                "reset_at": reset_at,
                "retry_after": self.retry_after,
            }
        })
    }

    /// Render the 429 response with a JSON body.
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body().to_string());
        *response.status_mut() = self.status();
        *response.headers_mut() = self.headers();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

impl From<QuotaExceeded> for Rejection {
    fn from(err: QuotaExceeded) -> Self {
        Self {
            rule: err.rule,
            metadata: RateLimitMetadata::from(&err.decision),
            retry_after: err.retry_after,
        }
    }
}

/// Runs the limiter in front of a request handler.
#[derive(Clone)]
pub struct EnforcementAdapter {
    limiter: Arc<RateLimiter>,
}

impl EnforcementAdapter {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Call before the handler. `rule` is a rule name or the request path.
    pub async fn before(
        &self,
        identity: &IdentityContext,
        rule: &str,
    ) -> Result<Admission, Rejection> {
        let decision = self.limiter.check(identity, rule).await;
        let now = self.limiter.clock().now();
        let rule_name = &self.limiter.catalog().resolve(rule).name;

        let outcome = translate(rule_name, &decision, now);
        if let Err(rejection) = &outcome {
            debug!(
                rule = %rejection.rule,
                retry_after = rejection.retry_after,
                "Rejecting request"
            );
        }
        outcome
    }
}

/// Map a decision to the adapter outcome at unix time `now`.
pub fn translate(rule: &str, decision: &Decision, now: f64) -> Result<Admission, Rejection> {
    let metadata = RateLimitMetadata::from(decision);

    if decision.allowed {
        Ok(Admission { metadata })
    } else {
        Err(Rejection {
            rule: rule.to_string(),
            metadata,
            retry_after: decision.retry_after(now),
        })
    }
}
