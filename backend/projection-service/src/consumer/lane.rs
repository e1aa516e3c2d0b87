use std::collections::BTreeMap;
use std::sync::Arc;

use event_schema::{ChangeEvent, IndexOperation, SourceRecord};
use idempotent_consumer::{IdempotencyError, IdempotencyTracker, ProgressStore};
use resilience::{with_retry_if, RetryError};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::source::{
    ChangeSource, PartitionAssignment, PartitionStart, SourceConnector, SourceError,
};
use super::{shutdown_requested, EngineDeps, EngineSettings, LaneState};
use crate::batch::{Batch, BatchAccumulator, PendingOperation};
use crate::enrichment::{EnrichOutcome, Enricher};
use crate::error::{ProjectionError, Result};
use crate::metrics;
use crate::transform::{transform, TransformOutcome};
use crate::writer::{AppliedOperation, IndexWriter};

async fn linger(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(super) struct Lane {
    id: usize,
    partitions: Vec<i32>,
    settings: Arc<EngineSettings>,
    connector: Arc<dyn SourceConnector>,
    progress: Arc<dyn ProgressStore>,
    tracker: IdempotencyTracker,
    enricher: Option<Arc<Enricher>>,
    writer: IndexWriter,
    accumulator: BatchAccumulator,
    state: watch::Sender<LaneState>,
    shutdown: watch::Receiver<bool>,
}

impl Lane {
    pub(super) fn new(
        id: usize,
        partitions: Vec<i32>,
        settings: Arc<EngineSettings>,
        deps: &EngineDeps,
        writer: IndexWriter,
        state: watch::Sender<LaneState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let accumulator = BatchAccumulator::new(settings.batch);
        Self {
            id,
            partitions,
            settings,
            connector: deps.connector.clone(),
            progress: deps.progress.clone(),
            tracker: deps.tracker.clone(),
            enricher: deps.enricher.clone(),
            writer,
            accumulator,
            state,
            shutdown,
        }
    }

    fn set_state(&self, next: LaneState) {
        metrics::set_lane_state(self.id, next.code());
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            debug!(lane = self.id, state = next.as_str(), "Lane state changed");
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(super) async fn run(mut self) -> Result<()> {
        self.set_state(LaneState::Starting);
        let outcome = self.run_inner().await;
        match &outcome {
            Ok(()) => {
                info!(lane = self.id, partitions = ?self.partitions, "Lane stopped");
                self.set_state(LaneState::Stopped);
            }
            Err(err) => {
                error!(lane = self.id, partitions = ?self.partitions, error = %err, "Lane failed");
                self.set_state(LaneState::Failed(err.to_string()));
            }
        }
        outcome
    }

    async fn run_inner(&mut self) -> Result<()> {
        let assignments = self.load_assignments().await?;
        let Some(mut source) = self.open_source(&assignments).await? else {
            return Ok(());
        };

        self.set_state(LaneState::Running);
        info!(lane = self.id, partitions = ?self.partitions, "Lane running");

        let mut consecutive_failures = 0u32;
        loop {
            if self.stopping() {
                break;
            }

            let deadline = self.accumulator.deadline();
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut self.shutdown) => break,

                _ = linger(deadline) => self.flush().await?,

                received = source.recv() => match received {
                    Ok(record) => {
                        consecutive_failures = 0;
                        self.handle_record(record).await;
                        if self.accumulator.should_flush_by_size() {
                            self.flush().await?;
                        }
                    }
                    Err(err) if err.is_transient() => {
                        consecutive_failures += 1;
                        let delay = self.settings.store_retry.delay_for_attempt(consecutive_failures);
                        warn!(
                            lane = self.id,
                            error = %err,
                            attempt = consecutive_failures,
                            delay_ms = delay.as_millis() as u64,
                            "Source unavailable, backing off"
                        );
                        self.set_state(LaneState::Backoff);
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown_requested(&mut self.shutdown) => {}
                        }
                        self.set_state(LaneState::Running);
                    }
                    Err(SourceError::Closed) => {
                        info!(lane = self.id, "Source closed");
                        break;
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }

        self.set_state(LaneState::Draining);
        info!(
            lane = self.id,
            pending = self.accumulator.len(),
            "Draining partial batch"
        );
        self.flush().await
    }

    /// Resume strictly after each partition's committed marker
    async fn load_assignments(&self) -> Result<Vec<PartitionAssignment>> {
        let mut assignments = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            let stream = self.settings.stream.as_str();
            let marker = with_retry_if(
                self.settings.store_retry.clone(),
                || self.progress.load(stream, partition),
                IdempotencyError::is_transient,
            )
            .await
            .map_err(|e| ProjectionError::Progress(e.into_inner()))?;

            let start = match &marker {
                Some(marker) => {
                    metrics::set_committed_offset(partition, marker.offset);
                    PartitionStart::Offset(marker.resume_offset())
                }
                None => PartitionStart::Position(self.settings.initial_position),
            };
            info!(
                lane = self.id,
                partition,
                committed = ?marker.as_ref().map(|m| m.offset),
                start = ?start,
                "Resuming partition"
            );
            assignments.push(PartitionAssignment { partition, start });
        }
        Ok(assignments)
    }

    /// `None` when shutdown arrives before the source could be opened
    async fn open_source(
        &mut self,
        assignments: &[PartitionAssignment],
    ) -> Result<Option<Box<dyn ChangeSource>>> {
        let mut attempt = 0u32;
        loop {
            match self.connector.open(&self.settings.stream, assignments).await {
                Ok(source) => return Ok(Some(source)),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    let delay = self.settings.store_retry.delay_for_attempt(attempt);
                    warn!(lane = self.id, error = %err, attempt, "Failed to open source, retrying");
                    self.set_state(LaneState::Backoff);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown_requested(&mut self.shutdown) => return Ok(None),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Decode → transform → tracker check → enrich → accumulate
    async fn handle_record(&mut self, record: SourceRecord) {
        let partition = record.partition;
        let offset = record.offset;
        metrics::record_consumed(partition);

        let event = match ChangeEvent::decode(&record) {
            Ok(event) => event,
            Err(err) if err.is_compaction_tombstone() => {
                debug!(lane = self.id, partition, offset, "Skipping compaction tombstone");
                self.accumulator.note_offset(partition, offset);
                return;
            }
            Err(err) => {
                warn!(
                    lane = self.id,
                    partition,
                    offset,
                    error = %err,
                    "Dropping undecodable change event"
                );
                metrics::record_dropped(err.kind());
                self.accumulator.note_offset(partition, offset);
                return;
            }
        };

        let op = match transform(&event) {
            TransformOutcome::Index(op) => op,
            TransformOutcome::Skip(reason) => {
                debug!(
                    partition,
                    offset,
                    identity = %event.key,
                    reason = reason.as_str(),
                    "Change event filtered"
                );
                metrics::record_filtered(reason.as_str());
                self.accumulator.note_offset(partition, offset);
                return;
            }
        };

        match self.tracker.should_apply(op.identity(), offset).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::record_stale("tracker", 1);
                self.accumulator.note_offset(partition, offset);
                return;
            }
            // The index's own version check still guards the write
            Err(err) => warn!(
                identity = %op.identity(),
                offset,
                error = %err,
                "Idempotency check failed, writing anyway"
            ),
        }

        // Validate only events past the watermark
        let op = match (op, &self.enricher) {
            (IndexOperation::Upsert(doc), Some(enricher)) => match enricher.enrich(doc).await {
                EnrichOutcome::Keep(doc) => IndexOperation::Upsert(doc),
                EnrichOutcome::Filter(reason) => {
                    metrics::record_filtered(reason.as_str());
                    self.accumulator.note_offset(partition, offset);
                    return;
                }
            },
            (op, _) => op,
        };

        self.accumulator.add(partition, offset, op);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.accumulator.is_empty() {
            return Ok(());
        }

        let batch = self.accumulator.drain();
        let started = Instant::now();
        let result = self.writer.apply(&batch).await?;

        debug!(
            lane = self.id,
            batch_id = %batch.batch_id,
            operations = batch.len(),
            applied = result.applied.len(),
            stale = result.stale,
            attempts = result.attempts,
            "Batch applied"
        );

        self.record_watermarks(&result.applied).await;
        self.commit(&result.committable).await?;

        if !result.is_complete() {
            let blocked: BTreeMap<i32, i64> = batch
                .high_offsets
                .iter()
                .filter(|(partition, _)| !result.committable.contains_key(partition))
                .map(|(partition, offset)| (*partition, *offset))
                .collect();
            self.recover_exhausted(result.exhausted, blocked).await?;
        }

        metrics::observe_flush(batch.len(), started.elapsed());
        Ok(())
    }

    /// Keep re-sending exhausted operations at the backoff cap until they land,
    /// then commit the partitions they were holding back.
    async fn recover_exhausted(
        &mut self,
        mut pending: Vec<PendingOperation>,
        blocked: BTreeMap<i32, i64>,
    ) -> Result<()> {
        for (partition, offset) in &blocked {
            metrics::record_retry_exhausted(*partition);
            warn!(
                lane = self.id,
                partition,
                offset,
                failed = pending.iter().filter(|p| p.partition == *partition).count(),
                "Index retries exhausted; partition blocked"
            );
        }
        self.set_state(LaneState::Backoff);

        let cadence = self.writer.retry_config().max_backoff;
        while !pending.is_empty() {
            tokio::select! {
                _ = sleep(cadence) => {}
                _ = shutdown_requested(&mut self.shutdown) => {
                    warn!(
                        lane = self.id,
                        partitions = ?blocked.keys().collect::<Vec<_>>(),
                        "Stopping with blocked partitions uncommitted; they will be replayed"
                    );
                    return Ok(());
                }
            }

            let retry = Batch::new(pending, BTreeMap::new());
            let result = self.writer.apply(&retry).await?;
            self.record_watermarks(&result.applied).await;
            pending = result.exhausted;
        }

        info!(lane = self.id, partitions = ?blocked.keys().collect::<Vec<_>>(), "Blocked partitions recovered");
        self.commit(&blocked).await?;
        self.set_state(LaneState::Running);
        Ok(())
    }

    async fn record_watermarks(&self, applied: &[AppliedOperation]) {
        for op in applied {
            if let Err(err) = self.tracker.record_applied(&op.identity, op.version).await {
                warn!(
                    identity = %op.identity,
                    version = op.version,
                    error = %err,
                    "Failed to record watermark"
                );
            }
        }
    }

    /// Persist markers; an exhausted store retry parks the lane in Backoff
    /// until the commit succeeds or shutdown is requested.
    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<()> {
        for (&partition, &offset) in offsets {
            loop {
                let stream = self.settings.stream.as_str();
                let progress = self.progress.as_ref();
                let committed = with_retry_if(
                    self.settings.store_retry.clone(),
                    || progress.commit(stream, partition, offset),
                    IdempotencyError::is_transient,
                )
                .await;

                match committed {
                    Ok(marker) => {
                        metrics::set_committed_offset(partition, marker.offset);
                        debug!(lane = self.id, partition, offset = marker.offset, "Progress committed");
                        break;
                    }
                    Err(RetryError::Permanent(err)) => return Err(err.into()),
                    Err(RetryError::Exhausted { last_error, .. }) => {
                        warn!(
                            lane = self.id,
                            partition,
                            offset,
                            error = %last_error,
                            "Progress commit failed, backing off"
                        );
                        self.set_state(LaneState::Backoff);
                        let cadence = self.settings.store_retry.max_backoff;
                        tokio::select! {
                            _ = sleep(cadence) => {}
                            // applied writes are replay-safe; the marker simply stays behind
                            _ = shutdown_requested(&mut self.shutdown) => return Ok(()),
                        }
                    }
                }
            }
        }
        if !self.stopping() {
            self.set_state(LaneState::Running);
        }
        Ok(())
    }
}
