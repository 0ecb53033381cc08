//! # Messaging Module
//!
//! Broker access for the daemon and the event pipeline.
//!
//! ## Features
//! - `MessagePublisher` / `MessageConsumer` traits, the seams the rest of
//!   the crate depends on
//! - Kafka backend (`KafkaBroker`) with lazily created producer and consumer
//! - In-process backend (`InMemoryBroker`) for tests and local runs

pub mod broker;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod memory;

pub use broker::KafkaBroker;
pub use kafka_consumer::KafkaStreamConsumer;
pub use kafka_producer::KafkaEventProducer;
pub use memory::InMemoryBroker;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use serde_json::Value;

use crate::types::{DeliveryReceipt, InboundMessage};

/// Errors surfaced by broker backends
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to create Kafka client: {0}")]
    Client(#[source] KafkaError),

    #[error("failed to subscribe to {topics:?}: {source}")]
    Subscribe {
        topics: Vec<String>,
        #[source]
        source: KafkaError,
    },

    #[error("failed to deliver message to `{topic}`: {source}")]
    Delivery {
        topic: String,
        #[source]
        source: KafkaError,
    },

    #[error("failed to commit offset {offset} on {topic}[{partition}]: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: KafkaError,
    },

    #[error("{count} queued message(s) were not delivered, first to `{topic}`: {reason}")]
    Undelivered {
        count: usize,
        topic: String,
        reason: String,
    },

    #[error("failed to receive message: {0}")]
    Receive(#[source] KafkaError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("consumer is closed")]
    Closed,
}

/// Whether offset commits wait for the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

impl From<CommitMode> for rdkafka::consumer::CommitMode {
    fn from(mode: CommitMode) -> Self {
        match mode {
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
        }
    }
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("expected `sync` or `async`, got `{}`", other)),
        }
    }
}

/// Whether produce waits for the broker acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Wait until the broker acknowledges the write
    Sync,
    /// Return once the message is queued locally
    Async,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("expected `sync` or `async`, got `{}`", other)),
        }
    }
}

/// Outbound side of the broker
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish raw bytes; delivery failures are returned, never dropped
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError>;

    /// Wait for queued messages and report any that were not delivered
    fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Topic `enqueue_event` publishes to
    fn events_topic(&self) -> &str;

    /// JSON-encode and publish a payload without a key
    async fn produce_json(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Result<DeliveryReceipt, BrokerError> {
        let bytes = serde_json::to_vec(payload)?;
        self.produce(topic, None, &bytes).await
    }

    /// Publish an entity event to the events topic, keyed by
    /// `kind.id.event` so every event for one entity lands on the same
    /// partition
    async fn enqueue_event(
        &self,
        kind: &str,
        id: &str,
        event: &str,
        payload: &Value,
    ) -> Result<DeliveryReceipt, BrokerError> {
        let key = [kind, id, event].join(".");
        let bytes = serde_json::to_vec(payload)?;
        self.produce(self.events_topic(), Some(&key), &bytes).await
    }
}

/// Inbound side of the broker
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Replace the subscription with the given topics
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message; `Ok(None)` means nothing
    /// arrived in time
    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    /// Mark `message` as processed on its own partition
    fn commit(&self, message: &InboundMessage, mode: CommitMode) -> Result<(), BrokerError>;

    /// Leave the group and release broker resources
    fn close(&self);
}
