#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use event_schema::{
    IndexOperation, ProjectionDocument, QualityChecks, QualityMetadata, SourceRecord,
};
use idempotent_consumer::{IdempotencyTracker, MemoryProgressStore, MemoryWatermarkStore};
use projection_service::batch::BatchSettings;
use projection_service::consumer::{
    ChangeSource, PartitionAssignment, PartitionStart, SourceConnector, SourceError,
    StartPosition,
};
use projection_service::enrichment::{EnrichmentError, Enricher, QualityValidator};
use projection_service::services::{
    IndexStore, IndexStoreError, ItemOutcome, NotificationMessage, NotificationSink, SinkError,
};
use projection_service::{EngineDeps, EngineSettings, ProjectionEngine, RunningEngine};
use resilience::{RetryConfig, ServiceConfig, TimeoutConfig};
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

pub const STREAM: &str = "cdc.public.documents";

// ============================================
// Change payloads
// ============================================

pub fn create(id: &str, title: &str) -> Value {
    json!({
        "op": "c",
        "before": null,
        "after": { "id": id, "title": title, "status": "created", "created_by": "u1" },
        "ts_ms": 1_700_000_000_000_i64
    })
}

pub fn update(id: &str, title: &str) -> Value {
    json!({
        "op": "u",
        "before": { "id": id },
        "after": { "id": id, "title": title, "status": "updated", "created_by": "u1" },
        "ts_ms": 1_700_000_000_000_i64
    })
}

/// Create for a document whose file has been uploaded, so it is scored
pub fn create_uploaded(id: &str, title: &str) -> Value {
    json!({
        "op": "c",
        "before": null,
        "after": {
            "id": id,
            "title": title,
            "status": "uploaded",
            "created_by": "u1",
            "content_type": "application/pdf",
            "content_size": 2048,
            "s3_key": format!("docs/{id}.pdf")
        },
        "ts_ms": 1_700_000_000_000_i64
    })
}

pub fn create_without_title(id: &str) -> Value {
    json!({
        "op": "c",
        "before": null,
        "after": { "id": id, "status": "created" },
        "ts_ms": 1_700_000_000_000_i64
    })
}

pub fn delete(id: &str) -> Value {
    json!({
        "op": "d",
        "before": { "id": id, "title": "gone" },
        "after": null,
        "ts_ms": 1_700_000_000_000_i64
    })
}

// ============================================
// In-memory partitioned log
// ============================================

#[derive(Default)]
struct LogInner {
    partitions: Mutex<BTreeMap<i32, Vec<SourceRecord>>>,
    appended: Notify,
}

/// Partitioned append-only log; offsets are positions within a partition
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new(partitions: &[i32]) -> Self {
        let log = Self::default();
        {
            let mut map = log.inner.partitions.lock().unwrap();
            for &p in partitions {
                map.entry(p).or_default();
            }
        }
        log
    }

    /// Append a change envelope keyed by its `after.id` or `before.id`
    pub fn append(&self, partition: i32, payload: Value) -> i64 {
        let id = payload["after"]["id"]
            .as_str()
            .or_else(|| payload["before"]["id"].as_str())
            .map(|id| format!(r#"{{"id":"{id}"}}"#));
        self.append_raw(
            partition,
            id.map(String::into_bytes),
            Some(payload.to_string().into_bytes()),
        )
    }

    pub fn append_raw(
        &self,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> i64 {
        let offset = {
            let mut map = self.inner.partitions.lock().unwrap();
            let records = map.entry(partition).or_default();
            let offset = records.len() as i64;
            records.push(SourceRecord {
                stream: STREAM.to_string(),
                partition,
                offset,
                key,
                payload,
                timestamp_ms: Some(1_700_000_000_000),
            });
            offset
        };
        self.inner.appended.notify_waiters();
        offset
    }

    fn len(&self, partition: i32) -> usize {
        self.inner
            .partitions
            .lock()
            .unwrap()
            .get(&partition)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl SourceConnector for MemoryLog {
    async fn partitions(&self, _stream: &str) -> Result<Vec<i32>, SourceError> {
        Ok(self.inner.partitions.lock().unwrap().keys().copied().collect())
    }

    async fn open(
        &self,
        _stream: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<Box<dyn ChangeSource>, SourceError> {
        let cursors = assignments
            .iter()
            .map(|a| {
                let cursor = match a.start {
                    PartitionStart::Offset(offset) => offset.max(0) as usize,
                    PartitionStart::Position(StartPosition::Earliest) => 0,
                    PartitionStart::Position(StartPosition::Latest) => self.len(a.partition),
                };
                (a.partition, cursor)
            })
            .collect();
        Ok(Box::new(MemorySource {
            log: self.clone(),
            cursors,
            next: 0,
        }))
    }
}

struct MemorySource {
    log: MemoryLog,
    cursors: Vec<(i32, usize)>,
    next: usize,
}

impl MemorySource {
    fn try_next(&mut self) -> Option<SourceRecord> {
        let map = self.log.inner.partitions.lock().unwrap();
        let n = self.cursors.len();
        for i in 0..n {
            let idx = (self.next + i) % n;
            let (partition, cursor) = self.cursors[idx];
            if let Some(record) = map.get(&partition).and_then(|r| r.get(cursor)) {
                self.cursors[idx].1 += 1;
                self.next = idx + 1;
                return Some(record.clone());
            }
        }
        None
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    /// Pends until a record is appended to an assigned partition
    async fn recv(&mut self) -> Result<SourceRecord, SourceError> {
        let inner = self.log.inner.clone();
        loop {
            let appended = inner.appended.notified();
            if let Some(record) = self.try_next() {
                return Ok(record);
            }
            appended.await;
        }
    }
}

// ============================================
// Versioned index fake
// ============================================

#[derive(Debug, Clone)]
struct Stored {
    version: i64,
    document: Option<ProjectionDocument>,
}

/// Rejects writes whose version is not above the stored one, like
/// Elasticsearch with `version_type=external`
#[derive(Default)]
pub struct FakeIndex {
    docs: Mutex<HashMap<String, Stored>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<Vec<(String, i64)>>>,
}

impl FakeIndex {
    pub fn fail_identity(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal_identity(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<ProjectionDocument> {
        self.docs.lock().unwrap().get(id).and_then(|s| s.document.clone())
    }

    pub fn version(&self, id: &str) -> Option<i64> {
        self.docs.lock().unwrap().get(id).map(|s| s.version)
    }

    pub fn live_documents(&self) -> usize {
        self.docs
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.document.is_some())
            .count()
    }

    /// `(identity, version)` of every operation per bulk request
    pub fn requests(&self) -> Vec<Vec<(String, i64)>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn operations_sent(&self) -> usize {
        self.requests.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl IndexStore for FakeIndex {
    async fn apply(
        &self,
        operations: &[IndexOperation],
    ) -> Result<Vec<ItemOutcome>, IndexStoreError> {
        self.requests.lock().unwrap().push(
            operations
                .iter()
                .map(|op| (op.identity().to_string(), op.version()))
                .collect(),
        );

        let failing = self.failing.lock().unwrap().clone();
        let mut docs = self.docs.lock().unwrap();
        Ok(operations
            .iter()
            .map(|op| {
                if failing.contains(op.identity()) {
                    return ItemOutcome::Failed("shard unavailable".to_string());
                }
                if let Some(stored) = docs.get(op.identity()) {
                    if op.version() <= stored.version {
                        return ItemOutcome::Stale;
                    }
                }
                docs.insert(
                    op.identity().to_string(),
                    Stored {
                        version: op.version(),
                        document: op.document().cloned(),
                    },
                );
                ItemOutcome::Applied
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), IndexStoreError> {
        Ok(())
    }
}

// ============================================
// Recording notification sink
// ============================================

#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, NotificationMessage)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, NotificationMessage)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(
        &self,
        identity: &str,
        message: &NotificationMessage,
    ) -> Result<usize, SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Timeout(Duration::from_millis(1)));
        }
        self.published
            .lock()
            .unwrap()
            .push((identity.to_string(), message.clone()));
        Ok(1)
    }
}

// ============================================
// Quality validator stub
// ============================================

/// Returns a fixed score, or fails every call when `score` is `None`
pub struct StubValidator {
    score: Option<f64>,
    min_quality_score: f64,
    calls: AtomicU32,
}

impl StubValidator {
    pub fn scoring(score: f64) -> Self {
        Self {
            score: Some(score),
            min_quality_score: 70.0,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            score: None,
            min_quality_score: 70.0,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityValidator for StubValidator {
    fn provider(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "fixed"
    }

    async fn validate(
        &self,
        _document: &ProjectionDocument,
    ) -> Result<QualityMetadata, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let score = self
            .score
            .ok_or_else(|| EnrichmentError::InvalidResponse("model returned prose".into()))?;
        Ok(QualityMetadata {
            quality_score: score,
            quality_is_valid: score >= self.min_quality_score,
            quality_issues: Vec::new(),
            has_pii: false,
            quality_checks: QualityChecks {
                completeness: score,
                consistency: score,
                pii_detection: score,
                language_quality: score,
            },
            quality_checked_at: Utc::now(),
            quality_provider: "stub".to_string(),
            quality_model: "fixed".to_string(),
        })
    }
}

pub fn enricher(validator: Arc<StubValidator>, block_low_quality: bool) -> Arc<Enricher> {
    let settings = ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(1),
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    };
    Arc::new(Enricher::new(validator, settings, block_low_quality))
}

// ============================================
// Engine harness
// ============================================

pub fn settings(partitions: &[i32], max_size: usize, max_linger: Duration) -> EngineSettings {
    EngineSettings {
        stream: STREAM.to_string(),
        partitions: Some(partitions.to_vec()),
        worker_count: None,
        initial_position: StartPosition::Earliest,
        batch: BatchSettings {
            max_size,
            max_linger,
        },
        write_retry: RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        write_timeout: Duration::from_secs(5),
        store_retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    }
}

/// Stores outlive engine runs so restarts can be exercised
pub struct Harness {
    pub log: MemoryLog,
    pub index: Arc<FakeIndex>,
    pub progress: Arc<MemoryProgressStore>,
    pub watermarks: Arc<MemoryWatermarkStore>,
}

impl Harness {
    pub fn new(partitions: &[i32]) -> Self {
        Self {
            log: MemoryLog::new(partitions),
            index: Arc::new(FakeIndex::default()),
            progress: Arc::new(MemoryProgressStore::new()),
            watermarks: Arc::new(MemoryWatermarkStore::new()),
        }
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            connector: Arc::new(self.log.clone()),
            index: self.index.clone(),
            progress: self.progress.clone(),
            tracker: IdempotencyTracker::new(self.watermarks.clone(), STREAM),
            enricher: None,
        }
    }

    pub async fn start(&self, settings: EngineSettings) -> (RunningEngine, watch::Sender<bool>) {
        self.start_with(settings, self.deps()).await
    }

    pub async fn start_with(
        &self,
        settings: EngineSettings,
        deps: EngineDeps,
    ) -> (RunningEngine, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = ProjectionEngine::new(settings, deps)
            .start(shutdown_rx)
            .await
            .expect("engine starts");
        (engine, shutdown_tx)
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.progress.committed(STREAM, partition)
    }
}

/// Poll `condition` every 10ms of (possibly paused) time
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..3000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn record(partition: i32, offset: i64, payload: &Value) -> SourceRecord {
    SourceRecord {
        stream: STREAM.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(payload.to_string().into_bytes()),
        timestamp_ms: None,
    }
}

pub fn document(id: &str, title: &str, version: i64) -> ProjectionDocument {
    ProjectionDocument {
        id: id.to_string(),
        title: title.to_string(),
        status: "created".to_string(),
        created_by: None,
        content_type: None,
        content_size: None,
        s3_key: None,
        created_at: None,
        updated_at: None,
        record_version: None,
        version,
        quality: None,
    }
}
