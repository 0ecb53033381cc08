//! Kafka broker client.
//!
//! Owns the connection settings and creates the producer and consumer on
//! first use. One client is constructed at startup and shared by reference;
//! dropping it releases both handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    BrokerError, CommitMode, KafkaEventProducer, KafkaStreamConsumer, MessageConsumer,
    MessagePublisher,
};
use crate::types::{BrokerConfig, DeliveryReceipt, InboundMessage};

/// Broker client backed by Kafka
pub struct KafkaBroker {
    config: BrokerConfig,
    producer: OnceLock<KafkaEventProducer>,
    consumer: OnceLock<KafkaStreamConsumer>,
    closed: AtomicBool,
}

impl KafkaBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            producer: OnceLock::new(),
            consumer: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The client's producer, created on first call
    pub fn producer(&self) -> Result<&KafkaEventProducer, BrokerError> {
        if let Some(producer) = self.producer.get() {
            return Ok(producer);
        }
        let created = KafkaEventProducer::new(&self.config).map_err(BrokerError::Client)?;
        Ok(self.producer.get_or_init(|| created))
    }

    /// The client's consumer, created on first call
    pub fn consumer(&self) -> Result<&KafkaStreamConsumer, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if let Some(consumer) = self.consumer.get() {
            return Ok(consumer);
        }
        let created = KafkaStreamConsumer::new(&self.config).map_err(BrokerError::Client)?;
        Ok(self.consumer.get_or_init(|| created))
    }
}

#[async_trait]
impl MessagePublisher for KafkaBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        self.producer()?.send(topic, key, payload).await
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        match self.producer.get() {
            Some(producer) => producer.flush(timeout),
            None => Ok(()),
        }
    }

    fn events_topic(&self) -> &str {
        &self.config.events_topic
    }
}

#[async_trait]
impl MessageConsumer for KafkaBroker {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.consumer()?.subscribe(topics)
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        self.consumer()?.recv(timeout).await
    }

    fn commit(&self, message: &InboundMessage, mode: CommitMode) -> Result<(), BrokerError> {
        self.consumer()?.commit(message, mode)?;
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Offset committed"
        );
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(consumer) = self.consumer.get() {
            consumer.unsubscribe();
        }
        info!("Kafka broker consumer closed");
    }
}

impl Drop for KafkaBroker {
    fn drop(&mut self) {
        if let Err(e) = MessagePublisher::flush(&*self, self.config.delivery_timeout) {
            warn!(error = %e, "Pending messages were not delivered before shutdown");
        }
    }
}
