//! Real-time notification sink
//!
//! Messages are published as JSON on `{prefix}:{identity}` so clients can
//! subscribe to a single document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_schema::{IndexOperation, ProjectionDocument};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub message_id: Uuid,
    pub identity: String,
    pub action: NotificationAction,
    pub version: i64,
    /// Absent for tombstones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<ProjectionDocument>,
    pub emitted_at: DateTime<Utc>,
}

impl NotificationMessage {
    /// Re-sends of the same change carry the same `message_id`
    pub fn from_operation(op: &IndexOperation) -> Self {
        let (action, document) = match op {
            IndexOperation::Upsert(doc) => (NotificationAction::Upsert, Some(doc.clone())),
            IndexOperation::Delete { .. } => (NotificationAction::Delete, None),
        };
        Self {
            message_id: message_id(op.identity(), op.version()),
            identity: op.identity().to_string(),
            action,
            version: op.version(),
            document,
            emitted_at: Utc::now(),
        }
    }
}

fn message_id(identity: &str, version: i64) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{identity}:{version}").as_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            SinkError::Serde(_) => false,
            SinkError::Timeout(_) => true,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publish `message` for `identity`; returns the number of receivers
    async fn publish(&self, identity: &str, message: &NotificationMessage)
        -> Result<usize, SinkError>;
}

/// Redis pub/sub sink
#[derive(Clone)]
pub struct RedisNotificationSink {
    client: ConnectionManager,
    channel_prefix: String,
}

impl RedisNotificationSink {
    pub async fn new(redis_url: &str, channel_prefix: &str) -> Result<Self, SinkError> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            client: connection,
            channel_prefix: channel_prefix.to_string(),
        })
    }

    pub fn channel_for(&self, identity: &str) -> String {
        channel_name(&self.channel_prefix, identity)
    }
}

pub fn channel_name(prefix: &str, identity: &str) -> String {
    format!("{prefix}:{identity}")
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn publish(
        &self,
        identity: &str,
        message: &NotificationMessage,
    ) -> Result<usize, SinkError> {
        let payload = serde_json::to_string(message)?;
        let channel = self.channel_for(identity);

        let mut conn = self.client.clone();
        let subscriber_count: usize = conn.publish(&channel, payload).await?;

        debug!(
            message_id = %message.message_id,
            channel = %channel,
            subscribers = subscriber_count,
            "Notification published"
        );
        Ok(subscriber_count)
    }
}
