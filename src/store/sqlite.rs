//! SQLite counter store.
//!
//! Each protocol runs in a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front. Concurrent transactions on the same key
//! therefore serialize instead of racing between their read and write.
//!
//! SQLite has one write lock per database, so transactions on different keys
//! serialize too. Waiting writers queue for up to `busy_timeout_ms` and fail
//! with a store error past that. Deployments that need keys to proceed fully
//! in parallel need a store with row-level locking.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::{CounterRecord, CounterStore, WindowCount};
use crate::config::{validate_table_name, LimiterConfig};
use crate::error::{QuotaError, Result};
use crate::ratelimit::TokenBucket;

/// SQL text for one counter table. The table name is validated before it is
/// interpolated here.
#[derive(Debug)]
struct Statements {
    create_table: String,
    fixed_update: String,
    fixed_insert: String,
    sliding_select: String,
    sliding_upsert: String,
    sliding_increment: String,
    bucket_select: String,
    bucket_insert: String,
    bucket_update: String,
    fetch_record: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            create_table: format!(
                r#"CREATE TABLE IF NOT EXISTS "{table}" (
                    "key" TEXT PRIMARY KEY,
                    "count" INTEGER,
                    "reset_at" INTEGER,
                    "tokens" INTEGER,
                    "last_refill" INTEGER
                )"#
            ),
            fixed_update: format!(
                r#"UPDATE "{table}"
                   SET "count" = CASE WHEN "reset_at" <= ?1 THEN 1 ELSE "count" + 1 END,
                       "reset_at" = CASE WHEN "reset_at" <= ?1 THEN ?2 ELSE "reset_at" END
                   WHERE "key" = ?3
                   RETURNING "count", "reset_at""#
            ),
            fixed_insert: format!(
                r#"INSERT INTO "{table}" ("key", "count", "reset_at") VALUES (?1, 1, ?2)
                   RETURNING "count", "reset_at""#
            ),
            sliding_select: format!(
                r#"SELECT "count" FROM "{table}" WHERE "key" = ?1 AND "reset_at" > ?2"#
            ),
            sliding_upsert: format!(
                r#"INSERT INTO "{table}" ("key", "count", "reset_at") VALUES (?1, 1, ?2)
                   ON CONFLICT("key") DO UPDATE
                   SET "count" = excluded."count", "reset_at" = excluded."reset_at""#
            ),
            sliding_increment: format!(
                r#"UPDATE "{table}" SET "count" = ?1 WHERE "key" = ?2
                   RETURNING "count", "reset_at""#
            ),
            bucket_select: format!(
                r#"SELECT "tokens", "last_refill" FROM "{table}" WHERE "key" = ?1"#
            ),
            bucket_insert: format!(
                r#"INSERT INTO "{table}" ("key", "tokens", "last_refill") VALUES (?1, ?2, ?3)"#
            ),
            bucket_update: format!(
                r#"UPDATE "{table}" SET "tokens" = ?1, "last_refill" = ?2 WHERE "key" = ?3"#
            ),
            fetch_record: format!(
                r#"SELECT "key", "count", "reset_at", "tokens", "last_refill"
                   FROM "{table}" WHERE "key" = ?1"#
            ),
        }
    }
}

/// Counter store backed by a SQLite database through an `sqlx` pool.
pub struct SqliteCounterStore {
    pool: SqlitePool,
    table: String,
    sql: Statements,
}

impl SqliteCounterStore {
    /// Open a connection pool for `config`.
    ///
    /// The database file is created if missing. In-memory databases are held
    /// on a single connection so that every caller sees the same data.
    pub async fn connect(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        if config.auth_token.is_some() {
            debug!("SQLite counter store does not use the auth token");
        }
        info!(
            table = %config.table_name,
            in_memory = in_memory,
            "Connected to counter store"
        );

        Self::from_pool(pool, &config.table_name)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            sql: Statements::new(table),
        })
    }

    /// Open a write transaction. Dropping it without committing rolls it back.
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn fixed_window_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        now: i64,
        window_ms: i64,
    ) -> Result<WindowCount> {
        let next_reset = now.saturating_add(window_ms);

        let updated: Option<(i64, i64)> = sqlx::query_as(&self.sql.fixed_update)
            .bind(now)
            .bind(next_reset)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;

        let (count, reset_at) = match updated {
            Some(row) => row,
            None => {
                sqlx::query_as(&self.sql.fixed_insert)
                    .bind(key)
                    .bind(next_reset)
                    .fetch_one(&mut *conn)
                    .await?
            }
        };

        Ok(WindowCount { count, reset_at })
    }

    async fn sliding_window_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        now: i64,
        window_start: i64,
        window_ms: i64,
    ) -> Result<WindowCount> {
        let current: Option<i64> = sqlx::query_scalar(&self.sql.sliding_select)
            .bind(key)
            .bind(window_start)
            .fetch_optional(&mut *conn)
            .await?;

        match current {
            None => {
                let reset_at = now.saturating_add(window_ms);
                sqlx::query(&self.sql.sliding_upsert)
                    .bind(key)
                    .bind(reset_at)
                    .execute(&mut *conn)
                    .await?;
                Ok(WindowCount { count: 1, reset_at })
            }
            Some(count) => {
                let (count, reset_at): (i64, i64) = sqlx::query_as(&self.sql.sliding_increment)
                    .bind(count + 1)
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(WindowCount { count, reset_at })
            }
        }
    }

    async fn consume_tokens_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        now: i64,
        bucket: &TokenBucket,
    ) -> Result<i64> {
        let row: Option<(i64, i64)> = sqlx::query_as(&self.sql.bucket_select)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;

        let Some((stored, last_refill)) = row else {
            let tokens = bucket.seeded_tokens();
            sqlx::query(&self.sql.bucket_insert)
                .bind(key)
                .bind(tokens)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            return Ok(tokens);
        };

        let available = bucket.refill(stored, last_refill, now);
        if available < bucket.tokens_to_consume {
            debug!(
                key = %key,
                available = available,
                requested = bucket.tokens_to_consume,
                "Insufficient tokens"
            );
            return Err(QuotaError::InsufficientTokens {
                requested: bucket.tokens_to_consume,
                available,
            });
        }

        let tokens = available - bucket.tokens_to_consume;
        sqlx::query(&self.sql.bucket_update)
            .bind(tokens)
            .bind(now)
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(tokens)
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&self.sql.create_table)
            .execute(&self.pool)
            .await?;
        debug!(table = %self.table, "Counter table ready");
        Ok(())
    }

    async fn fixed_window(&self, key: &str, now: i64, window_ms: i64) -> Result<WindowCount> {
        let mut tx = self.begin().await?;
        let counter = self.fixed_window_tx(&mut tx, key, now, window_ms).await?;
        tx.commit().await?;
        trace!(key = %key, count = counter.count, reset_at = counter.reset_at, "Fixed window updated");
        Ok(counter)
    }

    async fn sliding_window(
        &self,
        key: &str,
        now: i64,
        window_start: i64,
        window_ms: i64,
    ) -> Result<WindowCount> {
        let mut tx = self.begin().await?;
        let counter = self
            .sliding_window_tx(&mut tx, key, now, window_start, window_ms)
            .await?;
        tx.commit().await?;
        trace!(key = %key, count = counter.count, reset_at = counter.reset_at, "Sliding window updated");
        Ok(counter)
    }

    async fn consume_tokens(&self, key: &str, now: i64, bucket: &TokenBucket) -> Result<i64> {
        let mut tx = self.begin().await?;
        let tokens = match self.consume_tokens_tx(&mut tx, key, now, bucket).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;
        trace!(key = %key, tokens = tokens, "Token bucket updated");
        Ok(tokens)
    }

    async fn fetch_record(&self, key: &str) -> Result<Option<CounterRecord>> {
        let record = sqlx::query_as::<_, CounterRecord>(&self.sql.fetch_record)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(table = %self.table, "Counter store closed");
    }
}
