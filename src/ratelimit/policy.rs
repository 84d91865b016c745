//! Admission policies and result assembly.
//!
//! A [`WindowPolicy`] is built from validated [`LimitOptions`] and drives one
//! atomic protocol against the counter store. Each variant keeps the exact
//! arithmetic callers observe through [`RateLimitResult`].

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use tracing::debug;

use super::key::EffectiveKey;
use super::options::{LimitOptions, RateLimitResult};
use super::window::window_millis;
use crate::error::{QuotaError, Result};
use crate::store::CounterStore;

/// Algorithm requested by the caller.
///
/// Unrecognized names fall back to the fixed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Algorithm {
    Sliding,
    TokenBucket,
    #[default]
    #[serde(other)]
    Fixed,
}

impl From<&str> for Algorithm {
    fn from(name: &str) -> Self {
        match name {
            "tokenBucket" => Algorithm::TokenBucket,
            "sliding" => Algorithm::Sliding,
            _ => Algorithm::Fixed,
        }
    }
}

impl FromStr for Algorithm {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Algorithm::from(s))
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    pub capacity: i64,
    /// Tokens added per second
    pub refill_rate: f64,
    pub tokens_to_consume: i64,
}

impl TokenBucket {
    /// Validate and build bucket parameters.
    pub fn new(capacity: i64, refill_rate: f64, tokens_to_consume: i64) -> Result<Self> {
        if capacity <= 0 {
            return Err(QuotaError::InvalidParameter {
                name: "capacity",
                reason: format!("must be a positive number, got {}", capacity),
            });
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(QuotaError::InvalidParameter {
                name: "refillRate",
                reason: format!("must be a positive number, got {}", refill_rate),
            });
        }
        if tokens_to_consume <= 0 {
            return Err(QuotaError::InvalidParameter {
                name: "tokensToConsume",
                reason: format!("must be a positive number, got {}", tokens_to_consume),
            });
        }
        if tokens_to_consume > capacity {
            return Err(QuotaError::InvalidParameter {
                name: "tokensToConsume",
                reason: format!("{} exceeds capacity {}", tokens_to_consume, capacity),
            });
        }
        Ok(Self {
            capacity,
            refill_rate,
            tokens_to_consume,
        })
    }

    /// Tokens left in a bucket seeded by its first request.
    pub fn seeded_tokens(&self) -> i64 {
        self.capacity - self.tokens_to_consume
    }

    /// Refill a bucket last refilled at `last_refill` up to `now` (both epoch ms).
    ///
    /// Only whole tokens are added and the result never exceeds `capacity`.
    pub fn refill(&self, tokens: i64, last_refill: i64, now: i64) -> i64 {
        let elapsed_secs = now.saturating_sub(last_refill).max(0) as f64 / 1000.0;
        let tokens_to_add = (elapsed_secs * self.refill_rate).floor() as i64;
        tokens.saturating_add(tokens_to_add).min(self.capacity)
    }

    /// Result for a request that left `tokens` in the bucket.
    ///
    /// `reset` is the time until a shortfall of the same request size would be
    /// met; it goes to zero or below while the bucket still covers a request.
    pub fn result(&self, tokens: i64) -> RateLimitResult {
        let shortfall = (self.tokens_to_consume - tokens) as f64;
        RateLimitResult {
            success: true,
            limit: self.capacity,
            remaining: tokens,
            reset: ((shortfall / self.refill_rate) * 1000.0).ceil() as i64,
        }
    }
}

/// The admission policy applied to one effective key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowPolicy {
    /// One counter that resets entirely when its window ends.
    Fixed { limit: i64, window_ms: i64 },
    /// Counter valid until its expiry marker falls out of the trailing window.
    ApproximateSliding { limit: i64, window_ms: i64 },
    TokenBucket(TokenBucket),
}

impl WindowPolicy {
    /// Validate `options` and select the policy they describe.
    ///
    /// No store access happens here; every validation failure surfaces first.
    pub fn from_options(options: &LimitOptions) -> Result<Self> {
        let window_ms = window_millis(options.window, options.time_unit)?;

        match options.algorithm {
            Algorithm::TokenBucket => {
                let capacity = options
                    .capacity
                    .ok_or(QuotaError::MissingParameter("capacity"))?;
                let refill_rate = options
                    .refill_rate
                    .ok_or(QuotaError::MissingParameter("refillRate"))?;
                let tokens_to_consume = options
                    .tokens_to_consume
                    .ok_or(QuotaError::MissingParameter("tokensToConsume"))?;
                Ok(WindowPolicy::TokenBucket(TokenBucket::new(
                    capacity,
                    refill_rate,
                    tokens_to_consume,
                )?))
            }
            Algorithm::Sliding => Ok(WindowPolicy::ApproximateSliding {
                limit: check_limit(options.limit)?,
                window_ms,
            }),
            Algorithm::Fixed => Ok(WindowPolicy::Fixed {
                limit: check_limit(options.limit)?,
                window_ms,
            }),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            WindowPolicy::Fixed { .. } => Algorithm::Fixed,
            WindowPolicy::ApproximateSliding { .. } => Algorithm::Sliding,
            WindowPolicy::TokenBucket(_) => Algorithm::TokenBucket,
        }
    }

    /// Run this policy's atomic protocol for `key` at time `now` (epoch ms).
    pub async fn apply<S>(&self, store: &S, key: &EffectiveKey, now: i64) -> Result<RateLimitResult>
    where
        S: CounterStore + ?Sized,
    {
        let result = match *self {
            WindowPolicy::Fixed { limit, window_ms } => {
                let counter = store.fixed_window(key.as_str(), now, window_ms).await?;
                window_result(limit, counter.count, counter.reset_at.saturating_sub(now))
            }
            WindowPolicy::ApproximateSliding { limit, window_ms } => {
                let window_start = now - window_ms;
                let counter = store
                    .sliding_window(key.as_str(), now, window_start, window_ms)
                    .await?;
                window_result(limit, counter.count, sliding_reset(window_ms))
            }
            WindowPolicy::TokenBucket(bucket) => {
                let tokens = store.consume_tokens(key.as_str(), now, &bucket).await?;
                bucket.result(tokens)
            }
        };

        if !result.success {
            debug!(
                key = %key,
                algorithm = ?self.algorithm(),
                limit = result.limit,
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }
}

fn check_limit(limit: i64) -> Result<i64> {
    if limit <= 0 {
        return Err(QuotaError::InvalidLimit(format!(
            "limit must be a positive number, got {}",
            limit
        )));
    }
    Ok(limit)
}

/// The sliding window always reports a full window until reset, whatever the
/// age of the stored counter.
fn sliding_reset(window_ms: i64) -> i64 {
    window_ms
}

fn window_result(limit: i64, count: i64, reset: i64) -> RateLimitResult {
    RateLimitResult {
        success: count <= limit,
        limit,
        remaining: (limit - count).max(0),
        reset: reset.max(0),
    }
}
