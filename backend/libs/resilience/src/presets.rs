/// Preset configurations for the pipeline's external dependencies
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for one dependency
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
}

/// Search index writes (bulk upserts/deletes)
///
/// - Timeout: 5s per attempt
/// - Retry: 5 attempts, 200ms base, 5s cap
pub fn index_store_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(5),
        },
        retry: RetryConfig::default(),
    }
}

/// Real-time notification publishes
///
/// Best-effort delivery; keep retries short so a slow sink is dropped quickly.
///
/// - Timeout: 2s
/// - Retry: 3 attempts, 50ms base, 1s cap
pub fn notification_sink_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(2),
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// LLM quality validation (third-party HTTP API)
///
/// - Timeout: 20s (model latency)
/// - Retry: 2 attempts, 500ms base
pub fn enrichment_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(20),
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Change-event source reconnects and progress store reads
///
/// - Timeout: 10s
/// - Retry: 5 attempts, 1s base, 30s cap
pub fn source_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}
