/// Batch application with partial-failure handling
///
/// Only the failed subset of a bulk request is re-sent. Partitions whose
/// operations all landed (applied or stale) are reported as committable even
/// when another partition in the same batch ran out of retries.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use event_schema::IndexOperation;
use resilience::{with_timeout, RetryConfig};
use tracing::{debug, warn};

use crate::batch::{Batch, PendingOperation};
use crate::metrics;
use crate::services::{IndexStore, ItemOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOperation {
    pub partition: i32,
    pub identity: String,
    pub version: i64,
}

#[derive(Debug, Default)]
pub struct WriteResult {
    pub applied: Vec<AppliedOperation>,
    pub stale: usize,
    /// Operations still failing after the last attempt
    pub exhausted: Vec<PendingOperation>,
    /// Partitions safe to commit, with the offset to commit
    pub committable: BTreeMap<i32, i64>,
    pub attempts: u32,
}

impl WriteResult {
    pub fn is_complete(&self) -> bool {
        self.exhausted.is_empty()
    }

    pub fn blocked_partitions(&self) -> BTreeSet<i32> {
        self.exhausted.iter().map(|p| p.partition).collect()
    }
}

/// Permanent write failure; retrying cannot help
#[derive(Debug, thiserror::Error)]
#[error("index rejected operation for {identity}: {reason}")]
pub struct WriteRejected {
    pub identity: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct IndexWriter {
    store: Arc<dyn IndexStore>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl IndexWriter {
    pub fn new(store: Arc<dyn IndexStore>, retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            attempt_timeout,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn apply(&self, batch: &Batch) -> Result<WriteResult, WriteRejected> {
        let mut result = WriteResult::default();
        let mut remaining: Vec<PendingOperation> = batch.operations.clone();
        let mut attempt = 0;

        while !remaining.is_empty() {
            attempt += 1;
            let ops: Vec<IndexOperation> = remaining.iter().map(|p| p.op.clone()).collect();

            let failed = match with_timeout(self.attempt_timeout, self.store.apply(&ops)).await {
                Ok(Ok(outcomes)) if outcomes.len() == remaining.len() => {
                    let mut failed = Vec::new();
                    for (pending, outcome) in remaining.into_iter().zip(outcomes) {
                        match outcome {
                            ItemOutcome::Applied => result.applied.push(AppliedOperation {
                                partition: pending.partition,
                                identity: pending.op.identity().to_string(),
                                version: pending.op.version(),
                            }),
                            ItemOutcome::Stale => {
                                debug!(
                                    identity = %pending.op.identity(),
                                    version = pending.op.version(),
                                    "Index holds a newer version"
                                );
                                result.stale += 1;
                            }
                            ItemOutcome::Failed(reason) => {
                                debug!(
                                    identity = %pending.op.identity(),
                                    partition = pending.partition,
                                    reason = %reason,
                                    "Index operation failed"
                                );
                                failed.push(pending);
                            }
                            ItemOutcome::Rejected(reason) => {
                                return Err(WriteRejected {
                                    identity: pending.op.identity().to_string(),
                                    reason,
                                });
                            }
                        }
                    }
                    failed
                }
                Ok(Ok(outcomes)) => {
                    warn!(
                        expected = remaining.len(),
                        received = outcomes.len(),
                        "Index store returned a mismatched outcome count"
                    );
                    remaining
                }
                Ok(Err(err)) if err.is_transient() => {
                    warn!(attempt, error = %err, "Bulk request failed");
                    remaining
                }
                Ok(Err(err)) => {
                    return Err(WriteRejected {
                        identity: remaining
                            .first()
                            .map(|p| p.op.identity().to_string())
                            .unwrap_or_default(),
                        reason: err.to_string(),
                    });
                }
                Err(elapsed) => {
                    warn!(attempt, error = %elapsed, "Bulk request timed out");
                    remaining
                }
            };

            remaining = failed;
            if remaining.is_empty() || !self.retry.should_retry(attempt) {
                break;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            metrics::record_write_retries(remaining.len());
            warn!(
                attempt,
                max_attempts = self.retry.max_attempts,
                failed = remaining.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying failed index operations"
            );
            tokio::time::sleep(delay).await;
        }

        result.attempts = attempt;
        result.exhausted = remaining;

        let blocked = result.blocked_partitions();
        result.committable = batch
            .high_offsets
            .iter()
            .filter(|(partition, _)| !blocked.contains(partition))
            .map(|(partition, offset)| (*partition, *offset))
            .collect();

        if result.stale > 0 {
            metrics::record_stale("index", result.stale as u64);
        }
        Ok(result)
    }
}
