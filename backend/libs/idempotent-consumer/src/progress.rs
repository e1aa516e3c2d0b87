//! Durable per-partition progress markers
//!
//! A marker records the last offset whose effects are durable in the index.
//! On startup a partition resumes strictly after its marker.

use crate::error::{IdempotencyError, IdempotencyResult};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub stream: String,
    pub partition: i32,
    pub offset: i64,
    pub committed_at: DateTime<Utc>,
}

impl ProgressMarker {
    /// First offset to read after a restart
    pub fn resume_offset(&self) -> i64 {
        self.offset + 1
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, stream: &str, partition: i32) -> IdempotencyResult<Option<ProgressMarker>>;

    /// Persist `offset` as committed. A marker never moves backwards; an
    /// older offset leaves the stored marker in place and returns it.
    async fn commit(
        &self,
        stream: &str,
        partition: i32,
        offset: i64,
    ) -> IdempotencyResult<ProgressMarker>;

    /// Forget the marker so the partition is reprocessed from its earliest
    /// retained offset. Returns whether a marker existed.
    async fn reset(&self, stream: &str, partition: i32) -> IdempotencyResult<bool>;
}

fn validate_offset(offset: i64) -> IdempotencyResult<()> {
    if offset < 0 {
        return Err(IdempotencyError::InvalidOffset(offset));
    }
    Ok(())
}

/// In-memory markers for tests and single-run deployments
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    markers: DashMap<(String, i32), ProgressMarker>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed offset for a partition, if any
    pub fn committed(&self, stream: &str, partition: i32) -> Option<i64> {
        self.markers
            .get(&(stream.to_string(), partition))
            .map(|m| m.offset)
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, stream: &str, partition: i32) -> IdempotencyResult<Option<ProgressMarker>> {
        Ok(self
            .markers
            .get(&(stream.to_string(), partition))
            .map(|m| m.clone()))
    }

    async fn commit(
        &self,
        stream: &str,
        partition: i32,
        offset: i64,
    ) -> IdempotencyResult<ProgressMarker> {
        validate_offset(offset)?;

        let mut entry = self
            .markers
            .entry((stream.to_string(), partition))
            .or_insert_with(|| ProgressMarker {
                stream: stream.to_string(),
                partition,
                offset,
                committed_at: Utc::now(),
            });

        if entry.offset < offset {
            entry.offset = offset;
            entry.committed_at = Utc::now();
        } else if entry.offset > offset {
            warn!(
                stream,
                partition,
                committed = entry.offset,
                requested = offset,
                "Ignoring progress commit behind stored marker"
            );
        }
        Ok(entry.clone())
    }

    async fn reset(&self, stream: &str, partition: i32) -> IdempotencyResult<bool> {
        Ok(self
            .markers
            .remove(&(stream.to_string(), partition))
            .is_some())
    }
}

/// PostgreSQL-backed markers (`progress_markers` table)
#[derive(Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn marker_from_row(row: &sqlx::postgres::PgRow) -> IdempotencyResult<ProgressMarker> {
        Ok(ProgressMarker {
            stream: row.try_get("stream")?,
            partition: row.try_get("partition")?,
            offset: row.try_get("committed_offset")?,
            committed_at: row.try_get("committed_at")?,
        })
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn load(&self, stream: &str, partition: i32) -> IdempotencyResult<Option<ProgressMarker>> {
        let row = sqlx::query(
            r#"
            SELECT stream, partition, committed_offset, committed_at
            FROM progress_markers
            WHERE stream = $1 AND partition = $2
            "#,
        )
        .bind(stream)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load progress marker")?;

        row.as_ref().map(Self::marker_from_row).transpose()
    }

    async fn commit(
        &self,
        stream: &str,
        partition: i32,
        offset: i64,
    ) -> IdempotencyResult<ProgressMarker> {
        validate_offset(offset)?;

        // GREATEST keeps the marker monotonic; RETURNING gives back whichever
        // value won.
        let row = sqlx::query(
            r#"
            INSERT INTO progress_markers (stream, partition, committed_offset, committed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stream, partition) DO UPDATE
                SET committed_offset = GREATEST(progress_markers.committed_offset, EXCLUDED.committed_offset),
                    committed_at = CASE
                        WHEN EXCLUDED.committed_offset > progress_markers.committed_offset
                        THEN EXCLUDED.committed_at
                        ELSE progress_markers.committed_at
                    END
            RETURNING stream, partition, committed_offset, committed_at
            "#,
        )
        .bind(stream)
        .bind(partition)
        .bind(offset)
        .fetch_one(&self.pool)
        .await
        .context("Failed to commit progress marker")?;

        let marker = Self::marker_from_row(&row)?;
        debug!(
            stream,
            partition,
            offset = marker.offset,
            "Progress marker committed"
        );
        Ok(marker)
    }

    async fn reset(&self, stream: &str, partition: i32) -> IdempotencyResult<bool> {
        let result = sqlx::query("DELETE FROM progress_markers WHERE stream = $1 AND partition = $2")
            .bind(stream)
            .bind(partition)
            .execute(&self.pool)
            .await
            .context("Failed to reset progress marker")?;

        let existed = result.rows_affected() > 0;
        if existed {
            info!(stream, partition, "Progress marker reset");
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_then_load() {
        let store = MemoryProgressStore::new();
        assert!(store.load("docs", 0).await.unwrap().is_none());

        let marker = store.commit("docs", 0, 41).await.unwrap();
        assert_eq!(marker.offset, 41);
        assert_eq!(marker.resume_offset(), 42);

        let loaded = store.load("docs", 0).await.unwrap().unwrap();
        assert_eq!(loaded.offset, 41);
        assert_eq!(loaded.partition, 0);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let store = MemoryProgressStore::new();
        store.commit("docs", 1, 100).await.unwrap();

        let marker = store.commit("docs", 1, 90).await.unwrap();
        assert_eq!(marker.offset, 100);
        assert_eq!(store.committed("docs", 1), Some(100));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = MemoryProgressStore::new();
        store.commit("docs", 0, 5).await.unwrap();
        store.commit("docs", 1, 9).await.unwrap();

        assert_eq!(store.committed("docs", 0), Some(5));
        assert_eq!(store.committed("docs", 1), Some(9));
        assert_eq!(store.committed("docs", 2), None);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryProgressStore::new();
        store.commit("docs", 0, 5).await.unwrap();

        assert!(store.reset("docs", 0).await.unwrap());
        assert!(!store.reset("docs", 0).await.unwrap());
        assert!(store.load("docs", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_offset_rejected() {
        let store = MemoryProgressStore::new();
        let err = store.commit("docs", 0, -1).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidOffset(-1)));
    }
}
