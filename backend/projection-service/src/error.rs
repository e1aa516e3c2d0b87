use idempotent_consumer::IdempotencyError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::consumer::SourceError;
use crate::services::IndexStoreError;
use crate::writer::WriteRejected;

/// Errors that stop a lane or the fan-out dispatcher
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("index store error: {0}")]
    Index(#[from] IndexStoreError),

    #[error(transparent)]
    Rejected(#[from] WriteRejected),

    #[error("progress store error: {0}")]
    Progress(#[from] IdempotencyError),

    #[error("{0}")]
    Fatal(String),
}

impl ProjectionError {
    /// Transient errors are retried with backoff; everything else halts the worker
    pub fn is_transient(&self) -> bool {
        match self {
            ProjectionError::Source(e) => e.is_transient(),
            ProjectionError::Index(e) => e.is_transient(),
            ProjectionError::Progress(e) => e.is_transient(),
            ProjectionError::Config(_) | ProjectionError::Rejected(_) | ProjectionError::Fatal(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
