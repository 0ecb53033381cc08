//! Kafka Producer for Event Publishing
//!
//! Publishes JSON-encoded domain events to Kafka.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error, instrument};

use super::{BrokerError, DeliveryMode};
use crate::types::{BrokerConfig, DeliveryReceipt};

/// Outcome of one queued delivery, `Err` carrying the failure reason
type DeliveryOutcome = BoxFuture<'static, Result<(), String>>;

/// Deliveries queued in async mode whose reports have not been checked yet
#[derive(Default)]
struct DeliveryTracker {
    pending: Vec<(String, DeliveryOutcome)>,
    failed: Vec<(String, String)>,
}

impl DeliveryTracker {
    fn track(&mut self, topic: &str, outcome: DeliveryOutcome) {
        self.reap();
        self.pending.push((topic.to_string(), outcome));
    }

    /// Move finished deliveries out of `pending`, keeping their failures
    fn reap(&mut self) {
        let failed = &mut self.failed;
        self.pending.retain_mut(|(topic, outcome)| match outcome.now_or_never() {
            None => true,
            Some(Ok(())) => false,
            Some(Err(reason)) => {
                error!(topic = %topic, reason = %reason, "Queued message was not delivered");
                failed.push((topic.clone(), reason));
                false
            }
        });
    }

    /// Collect every failure and every delivery still unresolved
    fn settle(&mut self) -> Result<(), BrokerError> {
        self.reap();
        let unresolved = self
            .pending
            .drain(..)
            .map(|(topic, _)| (topic, "no delivery report before flush returned".to_string()));
        let mut failed: Vec<(String, String)> = self.failed.drain(..).chain(unresolved).collect();

        if failed.is_empty() {
            return Ok(());
        }
        let count = failed.len();
        let (topic, reason) = failed.swap_remove(0);
        Err(BrokerError::Undelivered {
            count,
            topic,
            reason,
        })
    }
}

/// Kafka producer used by the broker client
pub struct KafkaEventProducer {
    producer: FutureProducer,
    delivery_mode: DeliveryMode,
    delivery_timeout: Duration,
    deliveries: Mutex<DeliveryTracker>,
}

impl KafkaEventProducer {
    /// Create a new Kafka producer
    pub fn new(config: &BrokerConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            )
            .create()?;

        debug!(
            bootstrap = %config.bootstrap_servers(),
            mode = ?config.delivery_mode,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            delivery_mode: config.delivery_mode,
            delivery_timeout: config.delivery_timeout,
            deliveries: Mutex::new(DeliveryTracker::default()),
        })
    }

    fn deliveries(&self) -> std::sync::MutexGuard<'_, DeliveryTracker> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish one message
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let mut record = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.delivery_mode {
            DeliveryMode::Sync => {
                match self.producer.send(record, self.delivery_timeout).await {
                    Ok((partition, offset)) => {
                        debug!(
                            topic = %topic,
                            partition = partition,
                            offset = offset,
                            "Message delivered"
                        );
                        Ok(DeliveryReceipt {
                            topic: topic.to_string(),
                            partition: Some(partition),
                            offset: Some(offset),
                        })
                    }
                    Err((e, _)) => {
                        error!(topic = %topic, error = %e, "Failed to deliver message");
                        Err(BrokerError::Delivery {
                            topic: topic.to_string(),
                            source: e,
                        })
                    }
                }
            }
            DeliveryMode::Async => match self.producer.send_result(record) {
                Ok(delivery) => {
                    let outcome = delivery
                        .map(|report| match report {
                            Ok(Ok(_)) => Ok(()),
                            Ok(Err((e, _))) => Err(e.to_string()),
                            Err(_) => Err("delivery report dropped".to_string()),
                        })
                        .boxed();
                    self.deliveries().track(topic, outcome);

                    Ok(DeliveryReceipt {
                        topic: topic.to_string(),
                        partition: None,
                        offset: None,
                    })
                }
                Err((e, _)) => {
                    error!(topic = %topic, error = %e, "Failed to enqueue message");
                    Err(BrokerError::Delivery {
                        topic: topic.to_string(),
                        source: e,
                    })
                }
            },
        }
    }

    /// Flush all pending messages and report queued deliveries that failed
    pub fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer
            .flush(timeout)
            .map_err(|source| BrokerError::Delivery {
                topic: "*".to_string(),
                source,
            })?;
        self.deliveries().settle()
    }
}
