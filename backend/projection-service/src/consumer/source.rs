//! Change-event source abstraction
//!
//! The engine tracks its own progress, so a source is opened with explicit
//! per-partition start points and never commits offsets itself.

use async_trait::async_trait;
use event_schema::SourceRecord;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where to begin reading a partition that has no progress marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Earliest,
    Latest,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "beginning" => Ok(StartPosition::Earliest),
            "latest" | "end" => Ok(StartPosition::Latest),
            other => Err(format!("unknown start position: {other}")),
        }
    }
}

/// Start point for one assigned partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStart {
    /// First offset to deliver (one past the committed marker)
    Offset(i64),
    Position(StartPosition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub partition: i32,
    pub start: PartitionStart,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Broker unreachable, rebalance in progress, fetch failure
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// Client misconfiguration or unknown stream
    #[error("source misconfigured: {0}")]
    Config(String),
    /// The source has no more records and will not produce any
    #[error("source closed")]
    Closed,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// An open, ordered feed of records for a fixed set of partitions
#[async_trait]
pub trait ChangeSource: Send {
    /// Next record. Suspends until one is available.
    async fn recv(&mut self) -> Result<SourceRecord, SourceError>;
}

/// Factory for [`ChangeSource`] handles
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Partitions of `stream`, ascending
    async fn partitions(&self, stream: &str) -> Result<Vec<i32>, SourceError>;

    /// Open a handle delivering only the given partitions
    async fn open(
        &self,
        stream: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<Box<dyn ChangeSource>, SourceError>;
}
