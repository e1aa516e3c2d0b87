//! Document CDC projection service
//!
//! Consumes Debezium change events for the `documents` table, projects them
//! into Elasticsearch with external versioning, and fans the same changes out
//! to Redis pub/sub for real-time subscribers.

pub mod batch;
pub mod config;
pub mod consumer;
pub mod enrichment;
pub mod error;
pub mod fanout;
pub mod health;
pub mod metrics;
pub mod services;
pub mod transform;
pub mod writer;

pub use config::Config;
pub use consumer::{EngineDeps, EngineSettings, LaneState, ProjectionEngine, RunningEngine};
pub use error::ProjectionError;
pub use fanout::{FanoutDispatcher, FanoutSettings};
