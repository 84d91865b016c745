//! Counter store abstraction.
//!
//! Every state transition runs inside one store transaction. Correctness under
//! concurrent callers, in this process or others sharing the store, rests on
//! that transaction serializing single-row read-modify-write sequences.

mod sqlite;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::ratelimit::TokenBucket;

pub use sqlite::SqliteCounterStore;

/// One row of the counter table.
///
/// Window algorithms use `count`/`reset_at`, the token bucket uses
/// `tokens`/`last_refill`; the other pair stays `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CounterRecord {
    pub key: String,
    pub count: Option<i64>,
    /// Epoch milliseconds
    pub reset_at: Option<i64>,
    pub tokens: Option<i64>,
    /// Epoch milliseconds
    pub last_refill: Option<i64>,
}

/// Counter state after a window algorithm updated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    pub reset_at: i64,
}

/// Trait for counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create the counter table if it does not exist. Existing rows are kept.
    async fn ensure_schema(&self) -> Result<()>;

    /// Fixed window: reset the counter if `reset_at <= now`, otherwise
    /// increment it; insert a fresh counter when the key is new.
    async fn fixed_window(&self, key: &str, now: i64, window_ms: i64) -> Result<WindowCount>;

    /// Approximate sliding window: increment the counter while its
    /// `reset_at > window_start`, otherwise overwrite it with a fresh one.
    async fn sliding_window(
        &self,
        key: &str,
        now: i64,
        window_start: i64,
        window_ms: i64,
    ) -> Result<WindowCount>;

    /// Refill and drain the bucket, returning the tokens left.
    ///
    /// Fails with `InsufficientTokens` and persists nothing when the refilled
    /// bucket cannot cover the request.
    async fn consume_tokens(&self, key: &str, now: i64, bucket: &TokenBucket) -> Result<i64>;

    /// Read the row stored under `key`.
    async fn fetch_record(&self, key: &str) -> Result<Option<CounterRecord>>;

    /// Release the store's connections.
    async fn close(&self);
}
