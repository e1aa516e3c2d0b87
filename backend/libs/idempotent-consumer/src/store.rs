//! Watermark storage backends
//!
//! A watermark is the highest source offset that has been applied to the
//! index for one record identity. Stores only ever move a watermark forward.

use crate::error::{IdempotencyError, IdempotencyResult};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

/// Backing store for per-identity high watermarks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Highest applied offset for `identity`, if any
    async fn get(&self, stream: &str, identity: &str) -> IdempotencyResult<Option<i64>>;

    /// Raise the watermark to `offset`.
    ///
    /// Returns `true` when the stored value moved, `false` when it was
    /// already at or above `offset`.
    async fn advance(&self, stream: &str, identity: &str, offset: i64) -> IdempotencyResult<bool>;

    /// Drop watermarks last touched before `cutoff`
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64>;
}

#[derive(Debug, Clone, Copy)]
struct Watermark {
    offset: i64,
    touched_at: DateTime<Utc>,
}

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    entries: DashMap<(String, String), Watermark>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, stream: &str, identity: &str) -> IdempotencyResult<Option<i64>> {
        Ok(self
            .entries
            .get(&(stream.to_string(), identity.to_string()))
            .map(|entry| entry.offset))
    }

    async fn advance(&self, stream: &str, identity: &str, offset: i64) -> IdempotencyResult<bool> {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry((stream.to_string(), identity.to_string()))
            .or_insert(Watermark {
                offset: i64::MIN,
                touched_at: now,
            });

        if entry.offset >= offset {
            return Ok(false);
        }
        entry.offset = offset;
        entry.touched_at = now;
        Ok(true)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64> {
        // Concurrent advances may insert while retaining; count only removals
        let mut removed = 0u64;
        self.entries.retain(|_, mark| {
            let keep = mark.touched_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/// PostgreSQL-backed store (`processed_offsets` table)
///
/// Survives restarts, so replays after a crash are skipped without a round
/// trip to the index.
#[derive(Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, stream: &str, identity: &str) -> IdempotencyResult<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT last_offset FROM processed_offsets
            WHERE stream = $1 AND identity = $2
            "#,
        )
        .bind(stream)
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load watermark")?;

        row.map(|r| r.try_get::<i64, _>("last_offset"))
            .transpose()
            .map_err(IdempotencyError::from)
    }

    async fn advance(&self, stream: &str, identity: &str, offset: i64) -> IdempotencyResult<bool> {
        // The WHERE clause on the conflict branch keeps the watermark monotonic
        // even when two writers race.
        let result = sqlx::query(
            r#"
            INSERT INTO processed_offsets (stream, identity, last_offset, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stream, identity) DO UPDATE
                SET last_offset = EXCLUDED.last_offset,
                    processed_at = EXCLUDED.processed_at
                WHERE processed_offsets.last_offset < EXCLUDED.last_offset
            "#,
        )
        .bind(stream)
        .bind(identity)
        .bind(offset)
        .execute(&self.pool)
        .await
        .context("Failed to advance watermark")?;

        let advanced = result.rows_affected() > 0;
        if !advanced {
            debug!(stream, identity, offset, "Watermark already at or above offset");
        }
        Ok(advanced)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> IdempotencyResult<u64> {
        let result = sqlx::query("DELETE FROM processed_offsets WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to cleanup old watermarks")?;

        let deleted_count = result.rows_affected();
        if deleted_count > 0 {
            info!(
                deleted_count = deleted_count,
                cutoff_time = %cutoff,
                "Cleaned up old watermarks"
            );
        }
        Ok(deleted_count)
    }
}
