use std::time::Duration;

use async_trait::async_trait;
use event_schema::SourceRecord;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::source::{
    ChangeSource, PartitionAssignment, PartitionStart, SourceConnector, SourceError,
    StartPosition,
};
use crate::config::KafkaConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct KafkaConnectorConfig {
    pub brokers: String,
    pub group_id: String,
    pub session_timeout_ms: u32,
}

impl KafkaConnectorConfig {
    pub fn from_kafka(config: &KafkaConfig, group_id: &str) -> Self {
        Self {
            brokers: config.brokers.clone(),
            group_id: group_id.to_string(),
            session_timeout_ms: config.session_timeout_ms,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            // Progress lives in the engine's own store
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", "300000");
        client
    }
}

/// rdkafka-backed connector using explicit partition assignment
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    config: KafkaConnectorConfig,
}

impl KafkaConnector {
    pub fn new(config: KafkaConnectorConfig) -> Self {
        Self { config }
    }
}

fn map_kafka_error(err: KafkaError) -> SourceError {
    match err {
        KafkaError::ClientCreation(msg) => SourceError::Config(msg),
        KafkaError::ClientConfig(_, desc, key, value) => {
            SourceError::Config(format!("{key}={value}: {desc}"))
        }
        other => SourceError::Unavailable(other.to_string()),
    }
}

fn to_offset(start: PartitionStart) -> Offset {
    match start {
        PartitionStart::Offset(offset) => Offset::Offset(offset),
        PartitionStart::Position(StartPosition::Earliest) => Offset::Beginning,
        PartitionStart::Position(StartPosition::Latest) => Offset::End,
    }
}

#[async_trait]
impl SourceConnector for KafkaConnector {
    async fn partitions(&self, stream: &str) -> Result<Vec<i32>, SourceError> {
        let client = self.config.client_config();
        let topic = stream.to_string();

        // Metadata fetch is a blocking librdkafka call
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = client.create().map_err(map_kafka_error)?;
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(map_kafka_error)?;

            let entry = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| SourceError::Config(format!("unknown topic {topic}")))?;

            if let Some(err) = entry.error() {
                return Err(SourceError::Unavailable(format!(
                    "metadata error for {topic}: {err:?}"
                )));
            }

            let mut partitions: Vec<i32> = entry.partitions().iter().map(|p| p.id()).collect();
            partitions.sort_unstable();
            if partitions.is_empty() {
                return Err(SourceError::Config(format!("topic {topic} has no partitions")));
            }
            Ok(partitions)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("metadata task failed: {e}")))?
    }

    async fn open(
        &self,
        stream: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<Box<dyn ChangeSource>, SourceError> {
        let consumer: StreamConsumer = self
            .config
            .client_config()
            .create()
            .map_err(map_kafka_error)?;

        let mut tpl = TopicPartitionList::new();
        for assignment in assignments {
            tpl.add_partition_offset(stream, assignment.partition, to_offset(assignment.start))
                .map_err(map_kafka_error)?;
        }
        consumer.assign(&tpl).map_err(map_kafka_error)?;

        info!(
            topic = %stream,
            group_id = %self.config.group_id,
            assignments = ?assignments,
            "Kafka partitions assigned"
        );

        Ok(Box::new(KafkaChangeSource { consumer }))
    }
}

pub struct KafkaChangeSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    async fn recv(&mut self) -> Result<SourceRecord, SourceError> {
        let message = self.consumer.recv().await.map_err(map_kafka_error)?;

        let record = SourceRecord {
            stream: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        };

        debug!(
            topic = %record.stream,
            partition = record.partition,
            offset = record.offset,
            "Received Kafka message"
        );
        Ok(record)
    }
}
