//! Service configuration loaded from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `KAFKA_BROKERS` | required |
//! | `KAFKA_CDC_TOPIC` | `cdc.public.documents` |
//! | `KAFKA_PROJECTION_GROUP_ID` | `nova-projection-service` |
//! | `KAFKA_SESSION_TIMEOUT_MS` | `45000` |
//! | `ELASTICSEARCH_URL` | `http://localhost:9200` |
//! | `ELASTICSEARCH_INDEX` | `documents` |
//! | `DATABASE_URL` | unset (in-memory progress and watermarks) |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `WATERMARK_RETENTION_DAYS` | `7` |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `PROJECTION_BATCH_MAX_SIZE` | `100` |
//! | `PROJECTION_BATCH_MAX_LINGER_MS` | `1000` |
//! | `PROJECTION_INITIAL_POSITION` | `earliest` |
//! | `PROJECTION_WORKER_COUNT` | one lane per partition |
//! | `PROJECTION_PARTITIONS` | discovered from the topic |
//! | `PROJECTION_RETRY_BASE_MS` | `200` |
//! | `PROJECTION_RETRY_CAP_MS` | `5000` |
//! | `PROJECTION_RETRY_MAX_ATTEMPTS` | `5` |
//! | `PROJECTION_WRITE_TIMEOUT_MS` | `5000` |
//! | `FANOUT_ENABLED` | `true` |
//! | `FANOUT_GROUP_ID` | `nova-projection-fanout` |
//! | `FANOUT_CHANNEL_PREFIX` | `documents` |
//! | `FANOUT_INITIAL_POSITION` | `latest` |
//! | `QUALITY_ENABLED` | `false` |
//! | `QUALITY_PROVIDER` | `heuristic` (`llm` needs `QUALITY_API_KEY`) |
//! | `QUALITY_API_BASE` | `https://api.openai.com/v1` |
//! | `QUALITY_MODEL` | `gpt-4o-mini` |
//! | `QUALITY_MIN_SCORE` | `50` |
//! | `QUALITY_BLOCK_LOW_QUALITY` | `false` |
//! | `QUALITY_TIMEOUT_SECS` | `20` |
//! | `HTTP_HOST` / `HTTP_PORT` | `0.0.0.0` / `8080` |

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::consumer::StartPosition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub projection: ProjectionConfig,
    pub retry: RetrySettings,
    pub fanout: FanoutConfig,
    pub quality: QualityConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub session_timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub index: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Without a database, progress markers and watermarks live in memory
    /// and a restart resumes from the initial position.
    pub url: Option<String>,
    pub max_connections: u32,
    pub watermark_retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    pub batch_max_size: usize,
    pub batch_max_linger_ms: u64,
    pub initial_position: StartPosition,
    pub worker_count: Option<usize>,
    pub partitions: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub write_timeout_ms: u64,
}

impl Default for RetrySettings {
    /// Index write preset
    fn default() -> Self {
        let preset = resilience::index_store_config();
        Self {
            base_ms: preset.retry.initial_backoff.as_millis() as u64,
            cap_ms: preset.retry.max_backoff.as_millis() as u64,
            max_attempts: preset.retry.max_attempts,
            write_timeout_ms: preset.timeout.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub enabled: bool,
    pub group_id: String,
    pub channel_prefix: String,
    pub initial_position: StartPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProvider {
    Heuristic,
    Llm,
}

impl FromStr for QualityProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heuristic" => Ok(QualityProvider::Heuristic),
            "llm" | "openai" => Ok(QualityProvider::Llm),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub enabled: bool,
    pub provider: QualityProvider,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub min_quality_score: f64,
    pub block_low_quality: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let retry_defaults = RetrySettings::default();
        let brokers = std::env::var("KAFKA_BROKERS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("KAFKA_BROKERS"))?;

        let config = Config {
            kafka: KafkaConfig {
                brokers,
                topic: env_string("KAFKA_CDC_TOPIC", "cdc.public.documents"),
                group_id: env_string("KAFKA_PROJECTION_GROUP_ID", "nova-projection-service"),
                session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS", 45_000)?,
            },
            elasticsearch: ElasticsearchConfig {
                url: env_string("ELASTICSEARCH_URL", "http://localhost:9200"),
                index: env_string("ELASTICSEARCH_INDEX", "documents"),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                watermark_retention_days: env_parse("WATERMARK_RETENTION_DAYS", 7)?,
            },
            redis: RedisConfig {
                url: env_string("REDIS_URL", "redis://localhost:6379"),
            },
            projection: ProjectionConfig {
                batch_max_size: env_parse("PROJECTION_BATCH_MAX_SIZE", 100)?,
                batch_max_linger_ms: env_parse("PROJECTION_BATCH_MAX_LINGER_MS", 1000)?,
                initial_position: env_parse(
                    "PROJECTION_INITIAL_POSITION",
                    StartPosition::Earliest,
                )?,
                worker_count: env_optional("PROJECTION_WORKER_COUNT")?,
                partitions: env_partitions("PROJECTION_PARTITIONS")?,
            },
            retry: RetrySettings {
                base_ms: env_parse("PROJECTION_RETRY_BASE_MS", retry_defaults.base_ms)?,
                cap_ms: env_parse("PROJECTION_RETRY_CAP_MS", retry_defaults.cap_ms)?,
                max_attempts: env_parse(
                    "PROJECTION_RETRY_MAX_ATTEMPTS",
                    retry_defaults.max_attempts,
                )?,
                write_timeout_ms: env_parse(
                    "PROJECTION_WRITE_TIMEOUT_MS",
                    retry_defaults.write_timeout_ms,
                )?,
            },
            fanout: FanoutConfig {
                enabled: env_parse("FANOUT_ENABLED", true)?,
                group_id: env_string("FANOUT_GROUP_ID", "nova-projection-fanout"),
                channel_prefix: env_string("FANOUT_CHANNEL_PREFIX", "documents"),
                initial_position: env_parse("FANOUT_INITIAL_POSITION", StartPosition::Latest)?,
            },
            quality: QualityConfig {
                enabled: env_parse("QUALITY_ENABLED", false)?,
                provider: env_parse("QUALITY_PROVIDER", QualityProvider::Heuristic)?,
                api_base: env_string("QUALITY_API_BASE", "https://api.openai.com/v1"),
                api_key: std::env::var("QUALITY_API_KEY")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                model: env_string("QUALITY_MODEL", "gpt-4o-mini"),
                min_quality_score: env_parse("QUALITY_MIN_SCORE", 50.0)?,
                block_low_quality: env_parse("QUALITY_BLOCK_LOW_QUALITY", false)?,
                timeout_secs: env_parse("QUALITY_TIMEOUT_SECS", 20)?,
            },
            http: HttpConfig {
                host: env_string("HTTP_HOST", "0.0.0.0"),
                port: env_parse("HTTP_PORT", 8080)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.topic.trim().is_empty() {
            return Err(ConfigError::Constraint("KAFKA_CDC_TOPIC is empty".into()));
        }
        if self.elasticsearch.index.trim().is_empty() {
            return Err(ConfigError::Constraint("ELASTICSEARCH_INDEX is empty".into()));
        }
        if self.projection.batch_max_size == 0 {
            return Err(ConfigError::Constraint(
                "batch max size must be at least 1".into(),
            ));
        }
        if self.projection.batch_max_linger_ms == 0 {
            return Err(ConfigError::Constraint(
                "batch max linger must be positive".into(),
            ));
        }
        if self.projection.worker_count == Some(0) {
            return Err(ConfigError::Constraint(
                "worker count must be at least 1".into(),
            ));
        }
        if let Some(partitions) = &self.projection.partitions {
            if partitions.is_empty() || partitions.iter().any(|p| *p < 0) {
                return Err(ConfigError::Constraint(format!(
                    "partition list must be non-empty and non-negative: {partitions:?}"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Constraint(
                "retry max attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_ms == 0 || self.retry.base_ms > self.retry.cap_ms {
            return Err(ConfigError::Constraint(format!(
                "retry base ({}ms) must be positive and not exceed cap ({}ms)",
                self.retry.base_ms, self.retry.cap_ms
            )));
        }
        if self.retry.write_timeout_ms == 0 {
            return Err(ConfigError::Constraint("write timeout must be positive".into()));
        }
        if self.fanout.enabled && self.fanout.group_id == self.kafka.group_id {
            return Err(ConfigError::Constraint(
                "fan-out must use its own consumer group".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.quality.min_quality_score) {
            return Err(ConfigError::Constraint(format!(
                "quality min score must be within 0-100, got {}",
                self.quality.min_quality_score
            )));
        }
        if self.quality.enabled
            && self.quality.provider == QualityProvider::Llm
            && self.quality.api_key.is_none()
        {
            return Err(ConfigError::Missing("QUALITY_API_KEY"));
        }
        Ok(())
    }

    pub fn batch_max_linger(&self) -> Duration {
        Duration::from_millis(self.projection.batch_max_linger_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.write_timeout_ms)
    }

    pub fn retry_config(&self) -> resilience::RetryConfig {
        resilience::RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.base_ms),
            max_backoff: Duration::from_millis(self.retry.cap_ms),
            ..resilience::index_store_config().retry
        }
    }

    pub fn watermark_retention(&self) -> Duration {
        Duration::from_secs(self.database.watermark_retention_days * 86_400)
    }
}

fn env_string(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_optional<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

fn env_partitions(key: &'static str) -> Result<Option<Vec<i32>>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => parse_partition_list(&value)
            .map(Some)
            .ok_or(ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

/// Parse `"0,1,2"` into partition numbers
pub fn parse_partition_list(raw: &str) -> Option<Vec<i32>> {
    raw.split(',')
        .map(|p| p.trim().parse::<i32>().ok())
        .collect()
}
