/// Size/linger bounded batching of index operations
///
/// The accumulator collects operations for one lane and tracks, per
/// partition, the highest offset it has seen. Offsets of events that produce
/// no operation (filtered, stale, undecodable) are noted too, so the progress
/// marker can move past them once the batch is flushed.
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use event_schema::IndexOperation;
use tokio::time::Instant;
use uuid::Uuid;

/// One index operation and the source position it came from
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub partition: i32,
    pub offset: i64,
    pub op: IndexOperation,
}

/// Drained contents of the accumulator, in arrival order
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<PendingOperation>,
    /// Highest offset represented per partition, including skipped events
    pub high_offsets: BTreeMap<i32, i64>,
}

impl Batch {
    pub fn new(operations: Vec<PendingOperation>, high_offsets: BTreeMap<i32, i64>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            operations,
            high_offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_size: usize,
    pub max_linger: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_linger: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct BatchAccumulator {
    settings: BatchSettings,
    operations: Vec<PendingOperation>,
    high_offsets: BTreeMap<i32, i64>,
    first_item_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            operations: Vec::with_capacity(settings.max_size),
            high_offsets: BTreeMap::new(),
            first_item_at: None,
        }
    }

    pub fn add(&mut self, partition: i32, offset: i64, op: IndexOperation) {
        self.note_offset(partition, offset);
        self.operations.push(PendingOperation {
            partition,
            offset,
            op,
        });
    }

    /// Record that `offset` was consumed without producing an operation
    pub fn note_offset(&mut self, partition: i32, offset: i64) {
        if self.first_item_at.is_none() {
            self.first_item_at = Some(Instant::now());
        }
        let high = self.high_offsets.entry(partition).or_insert(offset);
        if offset > *high {
            *high = offset;
        }
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush_by_size() || self.should_flush_by_time(Instant::now())
    }

    pub fn should_flush_by_size(&self) -> bool {
        self.operations.len() >= self.settings.max_size
    }

    pub fn should_flush_by_time(&self, now: Instant) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }

    /// When the linger timer fires, if anything is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.first_item_at
            .map(|first| first + self.settings.max_linger)
    }

    /// Take everything accumulated so far; the accumulator is empty afterwards.
    ///
    /// Takes `&mut self`, so no `add` can interleave with a drain.
    pub fn drain(&mut self) -> Batch {
        self.first_item_at = None;
        let operations = std::mem::replace(
            &mut self.operations,
            Vec::with_capacity(self.settings.max_size),
        );
        let high_offsets = std::mem::take(&mut self.high_offsets);
        Batch::new(operations, high_offsets)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// No operations and no noted offsets
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.high_offsets.is_empty()
    }
}
