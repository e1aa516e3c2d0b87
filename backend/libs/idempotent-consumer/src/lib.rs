//! # Idempotent Consumer Library
//!
//! Offset-based idempotency for change-event consumers. Each record identity
//! carries a high watermark: the largest source offset already applied to the
//! downstream store. An event at or below the watermark is a replay and can be
//! skipped without touching the store.
//!
//! ## Architecture
//!
//! ```text
//! Source → Consumer → IdempotencyTracker → Writer → Index
//!                          ↓        ↑
//!                  (should_apply)  (record_applied, after a durable write)
//!                          ↓
//!                   WatermarkStore
//!           (memory, or PostgreSQL processed_offsets)
//! ```
//!
//! The tracker is a fast path only. Watermarks are raised after a successful
//! write, so a crash between write and record leaves the watermark behind and
//! the event is re-applied; the downstream store must tolerate that (versioned
//! writes make it a no-op).
//!
//! The crate also owns [`ProgressStore`], the per-partition progress markers a
//! consumer resumes from after a restart.
//!
//! ## Usage Example
//!
//! ```ignore
//! use idempotent_consumer::{IdempotencyTracker, PgWatermarkStore};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let tracker = IdempotencyTracker::new(Arc::new(PgWatermarkStore::new(pool)), "documents");
//!
//! if tracker.should_apply("doc-1", 42).await? {
//!     write_to_index().await?;
//!     tracker.record_applied("doc-1", 42).await?;
//! }
//! # Ok(())
//! # }
//! # async fn write_to_index() -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! ```
//!
//! ## Database Migration
//!
//! ```bash
//! sqlx migrate run --source backend/libs/idempotent-consumer/migrations
//! ```
//!
//! or at startup via [`MIGRATOR`].

use chrono::Utc;
use sqlx::migrate::Migrator;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

mod error;
pub mod progress;
pub mod store;

pub use error::{IdempotencyError, IdempotencyResult};
pub use progress::{MemoryProgressStore, PgProgressStore, ProgressMarker, ProgressStore};
pub use store::{MemoryWatermarkStore, PgWatermarkStore, WatermarkStore};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Result of processing an event with idempotency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Event was processed and the watermark advanced
    Success,

    /// Offset was at or below the watermark (replay)
    AlreadyProcessed,

    /// Event processing failed with error message
    Failed(String),
}

impl ProcessingResult {
    /// Check if processing was successful (either first time or already processed)
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Success | ProcessingResult::AlreadyProcessed
        )
    }

    /// Check if processing failed
    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingResult::Failed(_))
    }
}

/// Per-identity offset high-watermark tracker for one stream
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct IdempotencyTracker {
    store: Arc<dyn WatermarkStore>,
    stream: String,
}

impl IdempotencyTracker {
    pub fn new(store: Arc<dyn WatermarkStore>, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }

    /// Tracker backed by a fresh [`MemoryWatermarkStore`]
    pub fn in_memory(stream: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryWatermarkStore::new()), stream)
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// `true` iff `offset` is strictly above the recorded watermark
    /// (or no watermark exists yet)
    pub async fn should_apply(&self, identity: &str, offset: i64) -> IdempotencyResult<bool> {
        Self::validate_identity(identity)?;
        Self::validate_offset(offset)?;

        let watermark = self.store.get(&self.stream, identity).await?;
        let apply = watermark.map_or(true, |applied| offset > applied);

        if !apply {
            debug!(
                stream = %self.stream,
                identity = %identity,
                offset = offset,
                watermark = ?watermark,
                "Offset at or below watermark"
            );
        }
        Ok(apply)
    }

    /// Raise the watermark after a successful downstream write.
    ///
    /// Returns `false` when the watermark was already at or above `offset`.
    pub async fn record_applied(&self, identity: &str, offset: i64) -> IdempotencyResult<bool> {
        Self::validate_identity(identity)?;
        Self::validate_offset(offset)?;

        self.store.advance(&self.stream, identity, offset).await
    }

    /// Run `f` only if `offset` is above the watermark, recording it on success
    pub async fn process_if_new<F, Fut>(
        &self,
        identity: &str,
        offset: i64,
        f: F,
    ) -> IdempotencyResult<ProcessingResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        if !self.should_apply(identity, offset).await? {
            return Ok(ProcessingResult::AlreadyProcessed);
        }

        match f().await {
            Ok(()) => {
                self.record_applied(identity, offset).await?;
                Ok(ProcessingResult::Success)
            }
            Err(e) => {
                warn!(
                    stream = %self.stream,
                    identity = %identity,
                    offset = offset,
                    error = ?e,
                    "Event processing failed"
                );
                Ok(ProcessingResult::Failed(e.to_string()))
            }
        }
    }

    /// Drop watermarks untouched for longer than `retention`
    pub async fn cleanup(&self, retention: Duration) -> IdempotencyResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).map_err(|e| {
                IdempotencyError::Other(anyhow::anyhow!("Invalid retention duration: {}", e))
            })?;
        self.store.cleanup_older_than(cutoff).await
    }

    fn validate_identity(identity: &str) -> IdempotencyResult<()> {
        if identity.is_empty() {
            return Err(IdempotencyError::InvalidIdentity(
                "Record identity cannot be empty".to_string(),
            ));
        }

        if identity.len() > 255 {
            return Err(IdempotencyError::InvalidIdentity(format!(
                "Record identity too long: {} characters (max 255)",
                identity.len()
            )));
        }

        Ok(())
    }

    fn validate_offset(offset: i64) -> IdempotencyResult<()> {
        if offset < 0 {
            return Err(IdempotencyError::InvalidOffset(offset));
        }
        Ok(())
    }
}
