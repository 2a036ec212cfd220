//! Rate limiting logic: strategies, rule catalog and the coordinator.

mod bucket;
pub mod catalog;
pub mod decision;
mod fixed_window;
pub mod key;
mod limiter;
mod sliding_window;
pub mod strategy;

pub use catalog::{RuleBinding, StrategyCatalog, DEFAULT_RULE};
pub use decision::{Decision, QuotaExceeded};
pub use key::{IdentityContext, RateLimitKey, Scope};
pub use limiter::{RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use strategy::{Evaluator, StrategyConfig};
