//! Error types for idempotent consumer library

use thiserror::Error;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while tracking watermarks and progress markers
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Record identity validation failed (empty, too long)
    #[error("Invalid record identity: {0}")]
    InvalidIdentity(String),

    /// Offsets are non-negative source positions
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Database(sqlx_err) => is_transient_sqlx(sqlx_err),
            IdempotencyError::Other(err) => err
                .downcast_ref::<sqlx::Error>()
                .map(is_transient_sqlx)
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            // 08xxx connection exceptions, 40001 serialization failure,
            // 40P01 deadlock, 57P01 admin shutdown
            db_err.code().map_or(false, |code| {
                code.starts_with("08") || matches!(code.as_ref(), "40001" | "40P01" | "57P01")
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = IdempotencyError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_context_wrapped_pool_timeout_is_transient() {
        let err = IdempotencyError::Other(
            anyhow::Error::new(sqlx::Error::PoolClosed).context("Failed to load marker"),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_validation_errors_are_permanent() {
        assert!(!IdempotencyError::InvalidIdentity("".to_string()).is_transient());
        assert!(!IdempotencyError::InvalidOffset(-1).is_transient());
        assert!(!IdempotencyError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
