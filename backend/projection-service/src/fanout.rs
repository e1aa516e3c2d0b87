//! Real-time fan-out of projected changes
//!
//! Reads the same stream as the projection engine under its own consumer
//! group and start position, runs the transformation stage, and publishes
//! each resulting document or tombstone to the notification sink. Delivery is
//! best-effort: a publish that still fails after bounded retries is dropped.

use std::sync::Arc;
use std::time::Duration;

use event_schema::{ChangeEvent, SourceRecord};
use idempotent_consumer::{IdempotencyTracker, ProcessingResult};
use resilience::{with_retry_if, with_timeout, ServiceConfig};
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::consumer::{
    shutdown_requested, ChangeSource, PartitionAssignment, PartitionStart, SourceConnector,
    SourceError, StartPosition,
};
use crate::error::{ProjectionError, Result};
use crate::metrics;
use crate::services::{NotificationMessage, NotificationSink, SinkError};
use crate::transform::{transform, TransformOutcome};

const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub stream: String,
    pub partitions: Option<Vec<i32>>,
    pub initial_position: StartPosition,
    pub sink: ServiceConfig,
    /// Source reconnect backoff
    pub source: ServiceConfig,
    /// Dedup watermarks untouched this long are dropped
    pub dedup_retention: Duration,
    pub dedup_cleanup_interval: Duration,
}

impl FanoutSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream: config.kafka.topic.clone(),
            partitions: config.projection.partitions.clone(),
            initial_position: config.fanout.initial_position,
            sink: resilience::notification_sink_config(),
            source: resilience::source_config(),
            dedup_retention: config.watermark_retention(),
            dedup_cleanup_interval: DEDUP_CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    /// Already delivered for this offset
    Duplicate,
    Filtered,
    /// Undecodable event
    Skipped,
    /// Publish failed after retries
    Dropped,
}

pub struct FanoutDispatcher {
    settings: FanoutSettings,
    connector: Arc<dyn SourceConnector>,
    sink: Arc<dyn NotificationSink>,
    tracker: IdempotencyTracker,
}

impl FanoutDispatcher {
    pub fn new(
        settings: FanoutSettings,
        connector: Arc<dyn SourceConnector>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let tracker = IdempotencyTracker::in_memory(format!("{}:fanout", settings.stream));
        Self {
            settings,
            connector,
            sink,
            tracker,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let Some(mut source) = self.connect(&mut shutdown).await? else {
            info!("Fan-out dispatcher stopped before connecting");
            return Ok(());
        };

        let mut cleanup = interval(self.settings.dedup_cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup.tick().await;

        let mut consecutive_failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = cleanup.tick() => {
                    self.cleanup_dedup().await;
                }

                received = source.recv() => match received {
                    Ok(record) => {
                        consecutive_failures = 0;
                        self.dispatch(record).await;
                    }
                    Err(err) if err.is_transient() => {
                        consecutive_failures += 1;
                        let delay = self.settings.source.retry.delay_for_attempt(consecutive_failures);
                        warn!(error = %err, delay_ms = delay.as_millis() as u64, "Fan-out source unavailable");
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Err(SourceError::Closed) => break,
                    Err(err) => return Err(ProjectionError::Source(err)),
                },
            }
        }

        info!("Fan-out dispatcher stopped");
        Ok(())
    }

    /// Resolve partitions and open the source, backing off on transient
    /// errors. `None` when shutdown arrives first.
    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Box<dyn ChangeSource>>> {
        let mut attempt = 0u32;
        loop {
            match self.try_connect().await {
                Ok(source) => return Ok(Some(source)),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    let delay = self.settings.source.retry.delay_for_attempt(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Fan-out source unavailable at startup, retrying"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown_requested(shutdown) => return Ok(None),
                    }
                }
                Err(err) => return Err(ProjectionError::Source(err)),
            }
        }
    }

    async fn try_connect(&self) -> std::result::Result<Box<dyn ChangeSource>, SourceError> {
        let partitions = match &self.settings.partitions {
            Some(partitions) => partitions.clone(),
            None => self.connector.partitions(&self.settings.stream).await?,
        };
        let assignments: Vec<PartitionAssignment> = partitions
            .iter()
            .map(|&partition| PartitionAssignment {
                partition,
                start: PartitionStart::Position(self.settings.initial_position),
            })
            .collect();

        let source = self
            .connector
            .open(&self.settings.stream, &assignments)
            .await?;
        info!(
            stream = %self.settings.stream,
            partitions = ?partitions,
            "Fan-out dispatcher running"
        );
        Ok(source)
    }

    /// Drop dedup watermarks older than the retention window
    pub async fn cleanup_dedup(&self) -> u64 {
        match self.tracker.cleanup(self.settings.dedup_retention).await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "Expired fan-out dedup entries removed");
                }
                removed
            }
            Err(err) => {
                warn!(error = %err, "Fan-out dedup cleanup failed");
                0
            }
        }
    }

    /// Forward one record to the sink; never fails the caller
    pub async fn dispatch(&self, record: SourceRecord) -> DispatchOutcome {
        let event = match ChangeEvent::decode(&record) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Fan-out skipping undecodable record"
                );
                return DispatchOutcome::Skipped;
            }
        };

        let op = match transform(&event) {
            TransformOutcome::Index(op) => op,
            TransformOutcome::Skip(_) => return DispatchOutcome::Filtered,
        };

        let message = NotificationMessage::from_operation(&op);
        let identity = op.identity();
        let offset = event.offset();

        let outcome = self
            .tracker
            .process_if_new(identity, offset, || async {
                self.publish(identity, &message)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await;

        match outcome {
            Ok(ProcessingResult::Success) => {
                metrics::record_notification("published");
                DispatchOutcome::Published
            }
            Ok(ProcessingResult::AlreadyProcessed) => {
                metrics::record_notification("duplicate");
                DispatchOutcome::Duplicate
            }
            Ok(ProcessingResult::Failed(reason)) => {
                warn!(identity = %identity, offset, reason = %reason, "Dropping notification");
                metrics::record_notification("dropped");
                DispatchOutcome::Dropped
            }
            Err(err) => {
                // Tracker unusable for this identity; deliver without dedup
                warn!(identity = %identity, error = %err, "Fan-out dedup unavailable");
                match self.publish(identity, &message).await {
                    Ok(()) => {
                        metrics::record_notification("published");
                        DispatchOutcome::Published
                    }
                    Err(err) => {
                        warn!(identity = %identity, offset, error = %err, "Dropping notification");
                        metrics::record_notification("dropped");
                        DispatchOutcome::Dropped
                    }
                }
            }
        }
    }

    async fn publish(
        &self,
        identity: &str,
        message: &NotificationMessage,
    ) -> std::result::Result<(), SinkError> {
        let sink = self.sink.as_ref();
        let per_attempt = self.settings.sink.timeout.duration;
        with_retry_if(
            self.settings.sink.retry.clone(),
            || async move {
                match with_timeout(per_attempt, sink.publish(identity, message)).await {
                    Ok(published) => published.map(|_| ()),
                    Err(_) => Err(SinkError::Timeout(per_attempt)),
                }
            },
            SinkError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())
    }
}
