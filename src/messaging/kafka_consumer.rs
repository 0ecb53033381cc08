//! Kafka Consumer for the Stream Daemon
//!
//! Receives messages one at a time and commits offsets manually, only after
//! the daemon has decided what to do with each message.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::info;

use super::{BrokerError, CommitMode};
use crate::types::{BrokerConfig, InboundMessage};

/// Kafka consumer for the stream daemon
pub struct KafkaStreamConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

impl KafkaStreamConsumer {
    /// Create a new Kafka consumer with a freshly resolved group id
    pub fn new(config: &BrokerConfig) -> Result<Self, KafkaError> {
        let group_id = config.group.resolve();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()?;

        info!(
            bootstrap = %config.bootstrap_servers(),
            group = %group_id,
            "Kafka consumer created"
        );

        Ok(Self { consumer, group_id })
    }

    /// Subscribe to the given topics
    pub fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|source| BrokerError::Subscribe {
                topics: topics.to_vec(),
                source,
            })?;
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    /// Receive the next message, or `None` once `timeout` elapses
    pub async fn recv(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(InboundMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Ok(Err(e)) => Err(BrokerError::Receive(e)),
            Err(_) => Ok(None),
        }
    }

    /// Commit the position after `message` on its own partition
    pub fn commit(&self, message: &InboundMessage, mode: CommitMode) -> Result<(), BrokerError> {
        let commit_error = |source| BrokerError::Commit {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            source,
        };

        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(commit_error)?;

        self.consumer
            .commit(&positions, mode.into())
            .map_err(commit_error)
    }

    /// Leave the consumer group
    pub fn unsubscribe(&self) {
        self.consumer.unsubscribe();
        info!(group = %self.group_id, "Kafka consumer unsubscribed");
    }
}
