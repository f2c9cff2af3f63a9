//! Stateful admission gates: greylisting and rate limiting

pub mod greylist;
pub mod rate_limiter;

pub use greylist::{GreylistDecision, GreylistKey, GreylistStore};
pub use rate_limiter::{RateDecision, RateKey, RateLimiter};
