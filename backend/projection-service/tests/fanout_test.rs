mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use projection_service::consumer::{
    ChangeSource, PartitionAssignment, SourceConnector, SourceError, StartPosition,
};
use projection_service::fanout::{DispatchOutcome, FanoutDispatcher, FanoutSettings};
use projection_service::services::NotificationAction;
use resilience::{RetryConfig, ServiceConfig, TimeoutConfig};
use tokio::sync::watch;

fn fanout_settings(partitions: &[i32]) -> FanoutSettings {
    let quick = ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_millis(200),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    };
    FanoutSettings {
        stream: STREAM.to_string(),
        partitions: Some(partitions.to_vec()),
        initial_position: StartPosition::Latest,
        sink: quick.clone(),
        source: quick,
        dedup_retention: Duration::from_secs(3600),
        dedup_cleanup_interval: Duration::from_secs(3600),
    }
}

fn dispatcher(log: &MemoryLog, sink: &Arc<RecordingSink>) -> FanoutDispatcher {
    FanoutDispatcher::new(fanout_settings(&[0]), Arc::new(log.clone()), sink.clone())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_publishes_upsert() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&MemoryLog::new(&[0]), &sink);

    let outcome = fanout.dispatch(record(0, 7, &create("D1", "Hello"))).await;
    assert_eq!(outcome, DispatchOutcome::Published);

    let published = sink.published();
    assert_eq!(published.len(), 1);
    let (identity, message) = &published[0];
    assert_eq!(identity, "D1");
    assert_eq!(message.action, NotificationAction::Upsert);
    assert_eq!(message.version, 7);
    assert_eq!(message.document.as_ref().unwrap().title, "Hello");
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_publishes_delete_without_document() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&MemoryLog::new(&[0]), &sink);

    let outcome = fanout.dispatch(record(0, 3, &delete("D1"))).await;
    assert_eq!(outcome, DispatchOutcome::Published);

    let (_, message) = &sink.published()[0];
    assert_eq!(message.action, NotificationAction::Delete);
    assert!(message.document.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_event_published_once() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&MemoryLog::new(&[0]), &sink);
    let event = create("D1", "Hello");

    assert_eq!(fanout.dispatch(record(0, 4, &event)).await, DispatchOutcome::Published);
    assert_eq!(fanout.dispatch(record(0, 4, &event)).await, DispatchOutcome::Duplicate);
    assert_eq!(fanout.dispatch(record(0, 2, &event)).await, DispatchOutcome::Duplicate);
    assert_eq!(sink.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_filtered_and_undecodable_events_not_published() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&MemoryLog::new(&[0]), &sink);

    let filtered = fanout.dispatch(record(0, 1, &create_without_title("D3"))).await;
    assert_eq!(filtered, DispatchOutcome::Filtered);

    let mut garbage = record(0, 2, &create("D4", "x"));
    garbage.payload = Some(b"{broken".to_vec());
    assert_eq!(fanout.dispatch(garbage).await, DispatchOutcome::Skipped);

    assert!(sink.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_notification_can_be_delivered_later() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&MemoryLog::new(&[0]), &sink);
    let event = create("D1", "Hello");

    sink.set_failing(true);
    assert_eq!(fanout.dispatch(record(0, 5, &event)).await, DispatchOutcome::Dropped);
    assert!(sink.published().is_empty());

    sink.set_failing(false);
    assert_eq!(fanout.dispatch(record(0, 5, &event)).await, DispatchOutcome::Published);
    assert_eq!(sink.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_starts_at_latest() {
    let log = MemoryLog::new(&[0]);
    log.append(0, create("OLD", "before start"));

    let sink = Arc::new(RecordingSink::default());
    let fanout = dispatcher(&log, &sink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(fanout.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    log.append(0, create("NEW", "after start"));
    log.append(0, delete("NEW"));

    let published = sink.clone();
    eventually("both notifications", move || published.published().len() == 2).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let identities: Vec<String> = sink.published().into_iter().map(|(id, _)| id).collect();
    assert_eq!(identities, vec!["NEW".to_string(), "NEW".to_string()]);
}

/// Partition discovery fails `failures` times before reaching the log
struct UnstableConnector {
    log: MemoryLog,
    failures: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl SourceConnector for UnstableConnector {
    async fn partitions(&self, stream: &str) -> Result<Vec<i32>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Unavailable("broker not reachable".to_string()));
        }
        self.log.partitions(stream).await
    }

    async fn open(
        &self,
        stream: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<Box<dyn ChangeSource>, SourceError> {
        self.log.open(stream, assignments).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_retries_transient_startup_failure() {
    let log = MemoryLog::new(&[0]);
    let connector = Arc::new(UnstableConnector {
        log: log.clone(),
        failures: AtomicU32::new(1),
        calls: AtomicU32::new(0),
    });
    let sink = Arc::new(RecordingSink::default());
    let mut settings = fanout_settings(&[0]);
    settings.partitions = None;

    let fanout = FanoutDispatcher::new(settings, connector.clone(), sink.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(fanout.run(shutdown_rx));

    let discovered = connector.clone();
    eventually("partition discovery retried", move || {
        discovered.calls.load(Ordering::SeqCst) >= 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    log.append(0, create("D1", "after outage"));

    let published = sink.clone();
    eventually("notification after recovery", move || published.published().len() == 1).await;
    assert!(!task.is_finished());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_source_unavailable_stops_cleanly() {
    let connector = Arc::new(UnstableConnector {
        log: MemoryLog::new(&[0]),
        failures: AtomicU32::new(u32::MAX),
        calls: AtomicU32::new(0),
    });
    let mut settings = fanout_settings(&[0]);
    settings.partitions = None;

    let fanout = FanoutDispatcher::new(settings, connector.clone(), Arc::new(RecordingSink::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(fanout.run(shutdown_rx));

    let discovered = connector.clone();
    eventually("repeated discovery attempts", move || {
        discovered.calls.load(Ordering::SeqCst) >= 3
    })
    .await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dedup_cleanup_expires_old_entries() {
    let sink = Arc::new(RecordingSink::default());
    let mut settings = fanout_settings(&[0]);
    settings.dedup_retention = Duration::ZERO;
    let fanout = FanoutDispatcher::new(settings, Arc::new(MemoryLog::new(&[0])), sink.clone());
    let event = create("D1", "Hello");

    assert_eq!(fanout.dispatch(record(0, 4, &event)).await, DispatchOutcome::Published);
    assert_eq!(fanout.dispatch(record(0, 4, &event)).await, DispatchOutcome::Duplicate);

    // Retention is wall-clock based
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(fanout.cleanup_dedup().await, 1);

    assert_eq!(fanout.dispatch(record(0, 4, &event)).await, DispatchOutcome::Published);
    assert_eq!(sink.published().len(), 2);
}
