use async_trait::async_trait;
use event_schema::IndexOperation;

/// Result of one operation inside a bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied,
    /// The store already holds an equal or newer version
    Stale,
    /// Retryable (throttling, unavailable shard)
    Failed(String),
    /// Will never succeed (mapping or schema mismatch)
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexStoreError {
    #[error("index store unavailable: {0}")]
    Unavailable(String),
    #[error("index store rejected request: {0}")]
    Rejected(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IndexStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexStoreError::Unavailable(_))
    }
}

/// Versioned document store the engine projects into
///
/// Implementations must treat `IndexOperation::version` as an external
/// version: a write whose version is not greater than the stored one is
/// reported as [`ItemOutcome::Stale`] and changes nothing.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Apply operations in order; returns one outcome per operation.
    async fn apply(&self, operations: &[IndexOperation])
        -> Result<Vec<ItemOutcome>, IndexStoreError>;

    async fn health_check(&self) -> Result<(), IndexStoreError>;
}
