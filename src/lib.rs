//! Quotadb - keyed rate limiting over a transactional SQL store
//!
//! Given an identifier, decides whether its next action is admitted under a
//! fixed window, approximate sliding window or token bucket quota. Counter
//! state lives in one table row per key and is only changed inside store
//! transactions, so independent processes sharing the store stay consistent.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::LimiterConfig;
pub use error::{ErrorKind, QuotaError, Result};
pub use ratelimit::{Algorithm, LimitOptions, RateLimitResult, RateLimiter, TimeUnit};
