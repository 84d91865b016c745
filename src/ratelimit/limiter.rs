//! Core rate limiter implementation.

use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::key::EffectiveKey;
use super::options::{LimitOptions, RateLimitResult};
use super::policy::WindowPolicy;
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::{CounterRecord, CounterStore, SqliteCounterStore};

/// Keyed rate limiter over a transactional counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks. It holds
/// no counter state of its own; every decision is made inside a store
/// transaction.
pub struct RateLimiter<S: CounterStore = SqliteCounterStore> {
    store: S,
    /// Set once the counter table has been verified for this instance
    schema: OnceCell<()>,
}

impl RateLimiter<SqliteCounterStore> {
    /// Connect to the store described by `config`.
    pub async fn connect(config: &LimiterConfig) -> Result<Self> {
        let store = SqliteCounterStore::connect(config).await?;
        Ok(Self::with_store(store))
    }
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a rate limiter over an already opened store.
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            schema: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decide whether the next action for `options.key` is admitted.
    ///
    /// Window algorithms report rejection through `success: false`. The token
    /// bucket instead fails with `QuotaError::InsufficientTokens`.
    pub async fn limit(&self, options: &LimitOptions) -> Result<RateLimitResult> {
        self.limit_at(options, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn limit_at(
        &self,
        options: &LimitOptions,
        now: i64,
    ) -> Result<RateLimitResult> {
        let policy = WindowPolicy::from_options(options)?;
        let key = EffectiveKey::new(&options.key, options.prefix.as_deref());

        trace!(
            key = %key,
            algorithm = ?policy.algorithm(),
            "Checking rate limit"
        );

        self.ensure_initialized().await?;
        policy.apply(&self.store, &key, now).await
    }

    /// Create the counter table once per instance.
    pub async fn ensure_initialized(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                self.store.ensure_schema().await?;
                debug!("Counter store initialized");
                Ok::<(), crate::error::QuotaError>(())
            })
            .await?;
        Ok(())
    }

    /// Whether schema setup has completed for this instance.
    pub fn is_initialized(&self) -> bool {
        self.schema.initialized()
    }

    /// Read the stored counter row for a key, without modifying it.
    pub async fn record(&self, key: &str, prefix: Option<&str>) -> Result<Option<CounterRecord>> {
        self.ensure_initialized().await?;
        let key = EffectiveKey::new(key, prefix);
        self.store.fetch_record(key.as_str()).await
    }

    /// Release the store connection.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use crate::ratelimit::{Algorithm, TimeUnit, TokenBucket};
    use crate::store::WindowCount;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000_000;

    async fn create_test_limiter() -> (TempDir, RateLimiter) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("limits.db").display());
        let limiter = RateLimiter::connect(&LimiterConfig::new(url)).await.unwrap();
        (dir, limiter)
    }

    /// Store that counts calls and never touches any data.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn ensure_schema(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fixed_window(&self, _key: &str, now: i64, window_ms: i64) -> Result<WindowCount> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WindowCount {
                count: 1,
                reset_at: now + window_ms,
            })
        }

        async fn sliding_window(
            &self,
            _key: &str,
            now: i64,
            _window_start: i64,
            window_ms: i64,
        ) -> Result<WindowCount> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WindowCount {
                count: 1,
                reset_at: now + window_ms,
            })
        }

        async fn consume_tokens(&self, _key: &str, _now: i64, bucket: &TokenBucket) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(bucket.seeded_tokens())
        }

        async fn fetch_record(&self, _key: &str) -> Result<Option<CounterRecord>> {
            Ok(None)
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let (_dir, limiter) = create_test_limiter().await;
        assert!(!limiter.is_initialized());

        limiter
            .limit(&LimitOptions::new("user", 1, 60.0))
            .await
            .unwrap();
        assert!(limiter.is_initialized());
    }

    #[tokio::test]
    async fn test_fixed_window_limit() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 2, 60.0);

        let first = limiter.limit_at(&options, T0).await.unwrap();
        assert!(first.success);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.limit, 2);
        assert_eq!(first.reset, 60_000);

        let second = limiter.limit_at(&options, T0 + 10).await.unwrap();
        assert!(second.success);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.reset, 59_990);

        let third = limiter.limit_at(&options, T0 + 20).await.unwrap();
        assert!(!third.success);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_after_expiry() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 1, 1.0);

        assert!(limiter.limit_at(&options, T0).await.unwrap().success);
        assert!(!limiter.limit_at(&options, T0 + 500).await.unwrap().success);
        let renewed = limiter.limit_at(&options, T0 + 1000).await.unwrap();
        assert!(renewed.success);
        assert_eq!(renewed.reset, 1000);
    }

    #[tokio::test]
    async fn test_sliding_window_limit() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 5, 60.0).algorithm(Algorithm::Sliding);

        for i in 0..5 {
            let result = limiter.limit_at(&options, T0 + i).await.unwrap();
            assert!(result.success);
            assert_eq!(result.remaining, 4 - i);
            assert_eq!(result.reset, 60_000);
        }

        let sixth = limiter.limit_at(&options, T0 + 5).await.unwrap();
        assert!(!sixth.success);
        assert_eq!(sixth.remaining, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_consume() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 0, 1.0).token_bucket(10, 1.0, 3);

        let result = limiter.limit_at(&options, T0).await.unwrap();
        assert!(result.success);
        assert_eq!(result.remaining, 7);
        assert_eq!(result.limit, 10);
    }

    #[tokio::test]
    async fn test_token_bucket_exhausted() {
        let (_dir, limiter) = create_test_limiter().await;
        let drain = LimitOptions::new("user", 0, 1.0).token_bucket(10, 1.0, 10);
        let one = LimitOptions::new("user", 0, 1.0).token_bucket(10, 1.0, 1);

        let result = limiter.limit_at(&drain, T0).await.unwrap();
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset, 10_000);

        let err = limiter.limit_at(&one, T0).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::InsufficientTokens {
                requested: 1,
                available: 0
            }
        ));

        // one second later a single token has refilled
        let result = limiter.limit_at(&one, T0 + 1000).await.unwrap();
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (_dir, limiter) = create_test_limiter().await;
        let a = LimitOptions::new("alice", 1, 60.0);
        let b = LimitOptions::new("bob", 1, 60.0);
        let prefixed = LimitOptions::new("alice", 1, 60.0).prefix("upload");

        assert!(limiter.limit_at(&a, T0).await.unwrap().success);
        assert!(!limiter.limit_at(&a, T0).await.unwrap().success);
        assert!(limiter.limit_at(&b, T0).await.unwrap().success);
        assert!(limiter.limit_at(&prefixed, T0).await.unwrap().success);

        let record = limiter.record("alice", Some("upload")).await.unwrap().unwrap();
        assert_eq!(record.key, "upload:alice");
        assert_eq!(record.count, Some(1));
        let record = limiter.record("alice", None).await.unwrap().unwrap();
        assert_eq!(record.count, Some(2));
    }

    #[tokio::test]
    async fn test_validation_happens_before_store_access() {
        let limiter = RateLimiter::with_store(CountingStore::default());
        let invalid = [
            LimitOptions::new("user", 5, 0.0),
            LimitOptions::new("user", 5, f64::NAN),
            LimitOptions::new("user", 0, 60.0),
            LimitOptions::new("user", 5, 60.0).algorithm(Algorithm::TokenBucket),
            LimitOptions::new("user", 5, 60.0).token_bucket(10, -1.0, 1),
        ];

        for options in &invalid {
            let err = limiter.limit(options).await.unwrap_err();
            assert!(err.is_validation(), "expected validation error, got {err:?}");
        }
        assert_eq!(limiter.store().calls.load(Ordering::SeqCst), 0);
        assert!(!limiter.is_initialized());
    }

    #[tokio::test]
    async fn test_invalid_options_leave_store_unchanged() {
        let (_dir, limiter) = create_test_limiter().await;
        let valid = LimitOptions::new("user", 3, 60.0);
        limiter.limit_at(&valid, T0).await.unwrap();

        let bad_window = LimitOptions::new("user", 3, -5.0);
        assert!(limiter.limit_at(&bad_window, T0).await.is_err());

        let record = limiter.record("user", None).await.unwrap().unwrap();
        assert_eq!(record.count, Some(1));
    }

    #[tokio::test]
    async fn test_schema_initialized_once() {
        let limiter = RateLimiter::with_store(CountingStore::default());
        let options = LimitOptions::new("user", 5, 60.0);

        limiter.limit(&options).await.unwrap();
        limiter.limit(&options).await.unwrap();
        limiter.ensure_initialized().await.unwrap();

        // one schema check plus two fixed window updates
        assert_eq!(limiter.store().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_time_unit_normalization() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 1, 2.0).time_unit(TimeUnit::Minutes);

        let result = limiter.limit_at(&options, T0).await.unwrap();
        assert_eq!(result.reset, 120_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fixed_window_calls_lose_no_updates() {
        let (_dir, limiter) = create_test_limiter().await;
        let limiter = Arc::new(limiter);
        let calls = 25;

        let tasks = (0..calls).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .limit(&LimitOptions::new("shared", 10, 60.0))
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(tasks).await;
        let admitted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.success)
            .count();

        assert_eq!(admitted, 10);
        let record = limiter.record("shared", None).await.unwrap().unwrap();
        assert_eq!(record.count, Some(calls));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sliding_window_calls_lose_no_updates() {
        let (_dir, limiter) = create_test_limiter().await;
        let limiter = Arc::new(limiter);
        let calls = 20;

        let tasks = (0..calls).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let options = LimitOptions::new("shared", 100, 60.0).algorithm(Algorithm::Sliding);
                limiter.limit(&options).await.unwrap()
            })
        });
        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().success);
        }

        let record = limiter.record("shared", None).await.unwrap().unwrap();
        assert_eq!(record.count, Some(calls));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_on_distinct_keys_all_succeed() {
        let (_dir, limiter) = create_test_limiter().await;
        let limiter = Arc::new(limiter);
        let keys = 40;

        let tasks = (0..keys).map(|i| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let options = match i % 3 {
                    0 => LimitOptions::new(format!("client-{i}"), 1, 60.0),
                    1 => LimitOptions::new(format!("client-{i}"), 1, 60.0)
                        .algorithm(Algorithm::Sliding),
                    _ => LimitOptions::new(format!("client-{i}"), 0, 1.0).token_bucket(5, 1.0, 5),
                };
                limiter.limit(&options).await
            })
        });

        for result in futures::future::join_all(tasks).await {
            let result = result.unwrap().unwrap();
            assert!(result.success);
        }
        for i in 0..keys {
            let record = limiter.record(&format!("client-{i}"), None).await.unwrap().unwrap();
            match i % 3 {
                2 => assert_eq!(record.tokens, Some(0)),
                _ => assert_eq!(record.count, Some(1)),
            }
        }
    }

    #[tokio::test]
    async fn test_close_releases_store() {
        let (_dir, limiter) = create_test_limiter().await;
        let options = LimitOptions::new("user", 5, 60.0);
        limiter.limit(&options).await.unwrap();

        limiter.close().await;
        let err = limiter.limit(&options).await.unwrap_err();
        assert!(matches!(err, QuotaError::Store(_)));
    }
}
