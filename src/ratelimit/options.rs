//! Request options and results for a single admission check.

use serde::{Deserialize, Serialize};

use super::policy::Algorithm;
use super::window::TimeUnit;

/// Parameters of one `limit` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOptions {
    /// Caller identifier, e.g. a user id or IP address
    pub key: String,
    /// Maximum actions per window (window algorithms)
    #[serde(default)]
    pub limit: i64,
    /// Window length, expressed in `time_unit`
    #[serde(default)]
    pub window: f64,
    #[serde(default)]
    pub time_unit: TimeUnit,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Bucket size (token bucket only)
    #[serde(default)]
    pub capacity: Option<i64>,
    /// Tokens added per second (token bucket only)
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Tokens drained by this call (token bucket only)
    #[serde(default)]
    pub tokens_to_consume: Option<i64>,
    /// Namespace joined in front of `key`
    #[serde(default)]
    pub prefix: Option<String>,
}

impl LimitOptions {
    /// Options for a fixed window check of `limit` actions per `window` seconds.
    pub fn new(key: impl Into<String>, limit: i64, window: f64) -> Self {
        Self {
            key: key.into(),
            limit,
            window,
            time_unit: TimeUnit::default(),
            algorithm: Algorithm::default(),
            capacity: None,
            refill_rate: None,
            tokens_to_consume: None,
            prefix: None,
        }
    }

    pub fn time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Switch to the token bucket algorithm with all three of its parameters.
    pub fn token_bucket(mut self, capacity: i64, refill_rate: f64, tokens_to_consume: i64) -> Self {
        self.algorithm = Algorithm::TokenBucket;
        self.capacity = Some(capacity);
        self.refill_rate = Some(refill_rate);
        self.tokens_to_consume = Some(tokens_to_consume);
        self
    }
}

/// Outcome of an admission check, uniform across algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the action is admitted
    pub success: bool,
    /// The configured limit (bucket capacity for the token bucket)
    pub limit: i64,
    /// Actions or tokens left
    pub remaining: i64,
    /// Milliseconds until the quota frees up
    pub reset: i64,
}
