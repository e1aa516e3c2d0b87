//! Projection engine: partitioned lanes pulling change events into the index
//!
//! Partitions are spread over K lanes (`partition mod K`). A lane owns its
//! source handle, batch accumulator and progress markers, so a partition that
//! stalls on a failing write only holds back its own lane.

mod kafka;
mod lane;
mod source;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use idempotent_consumer::{IdempotencyTracker, ProgressStore};
use resilience::{with_retry_if, RetryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use kafka::{KafkaChangeSource, KafkaConnector, KafkaConnectorConfig};
pub use source::{
    ChangeSource, PartitionAssignment, PartitionStart, SourceConnector, SourceError,
    StartPosition,
};

use crate::batch::BatchSettings;
use crate::config::Config;
use crate::enrichment::Enricher;
use crate::error::{ProjectionError, Result};
use crate::services::IndexStore;
use crate::writer::IndexWriter;
use lane::Lane;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneState {
    Starting,
    Running,
    /// Waiting out a transient failure; partitions stay uncommitted meanwhile
    Backoff,
    Draining,
    Stopped,
    /// Halted on a non-retryable error
    Failed(String),
}

impl LaneState {
    /// Value exported on the `projection_lane_state` gauge
    pub fn code(&self) -> i64 {
        match self {
            LaneState::Starting => 0,
            LaneState::Running => 1,
            LaneState::Backoff => 2,
            LaneState::Draining => 3,
            LaneState::Stopped => 4,
            LaneState::Failed(_) => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaneState::Starting => "starting",
            LaneState::Running => "running",
            LaneState::Backoff => "backoff",
            LaneState::Draining => "draining",
            LaneState::Stopped => "stopped",
            LaneState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub stream: String,
    /// Fixed partition set; discovered from the source when `None`
    pub partitions: Option<Vec<i32>>,
    /// Lane count; one lane per partition when `None`
    pub worker_count: Option<usize>,
    pub initial_position: StartPosition,
    pub batch: BatchSettings,
    pub write_retry: RetryConfig,
    pub write_timeout: Duration,
    /// Marker loads/commits and source reconnects
    pub store_retry: RetryConfig,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream: config.kafka.topic.clone(),
            partitions: config.projection.partitions.clone(),
            worker_count: config.projection.worker_count,
            initial_position: config.projection.initial_position,
            batch: BatchSettings {
                max_size: config.projection.batch_max_size,
                max_linger: config.batch_max_linger(),
            },
            write_retry: config.retry_config(),
            write_timeout: config.write_timeout(),
            store_retry: resilience::source_config().retry,
        }
    }
}

/// Resolves once shutdown is requested (or the sender is gone)
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Collaborators shared by every lane
#[derive(Clone)]
pub struct EngineDeps {
    pub connector: Arc<dyn SourceConnector>,
    pub index: Arc<dyn IndexStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub tracker: IdempotencyTracker,
    pub enricher: Option<Arc<Enricher>>,
}

/// Group partitions into lanes; empty lanes are dropped.
///
/// Without a worker count every partition gets its own lane. With `K` lanes,
/// partition `p` goes to lane `p mod K`.
pub fn assign_lanes(partitions: &[i32], worker_count: Option<usize>) -> Vec<Vec<i32>> {
    let mut sorted = partitions.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let Some(lanes) = worker_count else {
        return sorted.into_iter().map(|partition| vec![partition]).collect();
    };
    let lanes = lanes.max(1);

    let mut groups = vec![Vec::new(); lanes];
    for partition in sorted {
        groups[partition.rem_euclid(lanes as i32) as usize].push(partition);
    }
    groups.retain(|g| !g.is_empty());
    groups
}

pub struct ProjectionEngine {
    settings: EngineSettings,
    deps: EngineDeps,
}

impl ProjectionEngine {
    pub fn new(settings: EngineSettings, deps: EngineDeps) -> Self {
        Self { settings, deps }
    }

    /// Resolve partitions and spawn one task per lane
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<RunningEngine> {
        let partitions = match &self.settings.partitions {
            Some(partitions) => partitions.clone(),
            None => {
                let connector = self.deps.connector.clone();
                let stream = self.settings.stream.clone();
                with_retry_if(
                    self.settings.store_retry.clone(),
                    || {
                        let connector = connector.clone();
                        let stream = stream.clone();
                        async move { connector.partitions(&stream).await }
                    },
                    SourceError::is_transient,
                )
                .await
                .map_err(|e| ProjectionError::Source(e.into_inner()))?
            }
        };

        let groups = assign_lanes(&partitions, self.settings.worker_count);
        if groups.is_empty() {
            return Err(ProjectionError::Fatal(format!(
                "stream {} has no partitions to project",
                self.settings.stream
            )));
        }

        info!(
            stream = %self.settings.stream,
            partitions = ?partitions,
            lanes = groups.len(),
            "Starting projection engine"
        );

        let settings = Arc::new(self.settings);
        let writer = IndexWriter::new(
            self.deps.index.clone(),
            settings.write_retry.clone(),
            settings.write_timeout,
        );

        let mut lanes = Vec::with_capacity(groups.len());
        for (id, partitions) in groups.into_iter().enumerate() {
            let (state_tx, state_rx) = watch::channel(LaneState::Starting);
            let lane = Lane::new(
                id,
                partitions.clone(),
                settings.clone(),
                &self.deps,
                writer.clone(),
                state_tx,
                shutdown.clone(),
            );
            lanes.push(LaneHandle {
                id,
                partitions,
                state: state_rx,
                task: tokio::spawn(lane.run()),
            });
        }

        Ok(RunningEngine { lanes })
    }
}

pub struct LaneHandle {
    pub id: usize,
    pub partitions: Vec<i32>,
    state: watch::Receiver<LaneState>,
    task: JoinHandle<Result<()>>,
}

impl LaneHandle {
    pub fn state(&self) -> LaneState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LaneState> {
        self.state.clone()
    }
}

pub struct RunningEngine {
    lanes: Vec<LaneHandle>,
}

impl RunningEngine {
    pub fn lanes(&self) -> &[LaneHandle] {
        &self.lanes
    }

    pub fn states(&self) -> Vec<LaneState> {
        self.lanes.iter().map(LaneHandle::state).collect()
    }

    /// State receivers for every lane, e.g. for readiness checks
    pub fn state_receivers(&self) -> Vec<watch::Receiver<LaneState>> {
        self.lanes.iter().map(LaneHandle::subscribe).collect()
    }

    /// Wait until `lane` reaches a state matching `predicate`
    pub async fn wait_for(
        &self,
        lane: usize,
        predicate: impl Fn(&LaneState) -> bool,
    ) -> Option<LaneState> {
        let mut rx = self.lanes.get(lane)?.subscribe();
        let reached = rx
            .wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| state.clone());
        reached
    }

    /// Wait for every lane to stop; returns the first lane failure
    pub async fn join(self) -> Result<()> {
        let ids: Vec<usize> = self.lanes.iter().map(|handle| handle.id).collect();
        let outcomes = join_all(self.lanes.into_iter().map(|handle| handle.task)).await;

        let mut first_error = None;
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|join_err| {
                Err(ProjectionError::Fatal(format!("lane {id} panicked: {join_err}")))
            });
            if let Err(err) = outcome {
                error!(lane = id, error = %err, "Lane halted");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
