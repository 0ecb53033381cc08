//! In-process broker.
//!
//! Keeps messages in memory with per-partition offsets. Produced messages
//! are queued for consumers, so the whole publish → consume path can run
//! inside one process without Kafka.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BrokerError, CommitMode, MessageConsumer, MessagePublisher};
use crate::types::{DeliveryReceipt, InboundMessage};

/// A message accepted by `produce`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl ProducedRecord {
    /// Payload decoded as JSON
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<InboundMessage>,
    next_offsets: HashMap<(String, i32), i64>,
    subscriptions: HashSet<String>,
    commits: Vec<(String, i32, i64)>,
    produced: Vec<ProducedRecord>,
    produce_failure: Option<String>,
    closed: bool,
}

impl State {
    fn enqueue(&mut self, topic: &str, partition: i32, key: Option<&str>, payload: Vec<u8>) -> i64 {
        let next = self
            .next_offsets
            .entry((topic.to_string(), partition))
            .or_insert(0);
        let offset = *next;
        *next += 1;

        let mut message = InboundMessage::new(topic, partition, offset, payload);
        message.key = key.map(|k| k.as_bytes().to_vec());
        self.queue.push_back(message);
        offset
    }

    fn take_next(&mut self) -> Option<InboundMessage> {
        let index = self
            .queue
            .iter()
            .position(|m| self.subscriptions.contains(&m.topic))?;
        self.queue.remove(index)
    }
}

/// In-memory broker implementing both broker traits
pub struct InMemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    events_topic: String,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker whose `enqueue_event` publishes to `events`
    pub fn new() -> Self {
        Self::with_events_topic("events")
    }

    pub fn with_events_topic(topic: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            events_topic: topic.into(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message for consumers and return its offset
    pub fn push(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = self.state().enqueue(topic, partition, None, payload.into());
        self.arrivals.notify_one();
        offset
    }

    /// Make every following `produce` fail with `reason`, or succeed again
    /// with `None`
    pub fn fail_produce_with(&self, reason: Option<&str>) {
        self.state().produce_failure = reason.map(str::to_string);
    }

    /// Commits in the order they were made, as `(topic, partition, offset)`
    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.state().commits.clone()
    }

    /// Messages accepted by `produce`, in order
    pub fn produced(&self) -> Vec<ProducedRecord> {
        self.state().produced.clone()
    }

    /// Messages not yet handed to a consumer
    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state().subscriptions.iter().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let offset = {
            let mut state = self.state();
            if let Some(reason) = &state.produce_failure {
                return Err(BrokerError::Unavailable(reason.clone()));
            }
            state.produced.push(ProducedRecord {
                topic: topic.to_string(),
                key: key.map(str::to_string),
                payload: payload.to_vec(),
            });
            state.enqueue(topic, 0, key, payload.to_vec())
        };
        self.arrivals.notify_one();

        Ok(DeliveryReceipt {
            topic: topic.to_string(),
            partition: Some(0),
            offset: Some(offset),
        })
    }

    fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }

    fn events_topic(&self) -> &str {
        &self.events_topic
    }
}

#[async_trait]
impl MessageConsumer for InMemoryBroker {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.subscriptions = topics.iter().cloned().collect();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(message) = state.take_next() {
                return Ok(Some(message));
            }
        }

        if tokio::time::timeout(timeout, self.arrivals.notified())
            .await
            .is_err()
        {
            return Ok(None);
        }

        let mut state = self.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(state.take_next())
    }

    fn commit(&self, message: &InboundMessage, _mode: CommitMode) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state
            .commits
            .push((message.topic.clone(), message.partition, message.offset));
        Ok(())
    }

    fn close(&self) {
        self.state().closed = true;
        self.arrivals.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_only_returns_subscribed_topics() {
        let broker = InMemoryBroker::new();
        broker.push("other", 0, b"{}".to_vec());
        broker.push("orders", 0, b"{\"id\":1}".to_vec());
        broker.subscribe(&["orders".to_string()]).unwrap();

        let message = broker
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message");
        assert_eq!(message.topic, "orders");
        assert_eq!(message.offset, 0);

        assert!(broker.poll(Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(broker.pending(), 1);
    }

    #[tokio::test]
    async fn test_offsets_are_per_partition() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.push("orders", 0, b"a".to_vec()), 0);
        assert_eq!(broker.push("orders", 1, b"b".to_vec()), 0);
        assert_eq!(broker.push("orders", 0, b"c".to_vec()), 1);
    }

    #[tokio::test]
    async fn test_produce_failure_is_returned() {
        let broker = InMemoryBroker::new();
        broker.fail_produce_with(Some("down"));

        let err = broker.produce("t", Some("k"), b"{}").await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(broker.produced().is_empty());

        broker.fail_produce_with(None);
        let receipt = broker.produce("t", Some("k"), b"{}").await.unwrap();
        assert_eq!(receipt.offset, Some(0));
    }

    #[tokio::test]
    async fn test_enqueue_event_key() {
        let broker = InMemoryBroker::with_events_topic("app:events");
        broker
            .enqueue_event("order", "7", "created", &serde_json::json!({"id": 7}))
            .await
            .unwrap();

        let produced = broker.produced();
        assert_eq!(produced[0].topic, "app:events");
        assert_eq!(produced[0].key.as_deref(), Some("order.7.created"));
        assert_eq!(produced[0].json().unwrap(), serde_json::json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_produce_json_has_no_key() {
        let broker = InMemoryBroker::new();
        broker.subscribe(&["balances".to_string()]).unwrap();

        let receipt = broker
            .produce_json("balances", &serde_json::json!({"currency": "btc", "amount": "1.5"}))
            .await
            .unwrap();
        assert_eq!(receipt.topic, "balances");

        let message = broker
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message");
        assert_eq!(message.key, None);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&message.payload).unwrap(),
            serde_json::json!({"currency": "btc", "amount": "1.5"})
        );
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_poll() {
        let broker = InMemoryBroker::new();
        broker.close();
        assert!(matches!(
            broker.poll(Duration::from_millis(1)).await,
            Err(BrokerError::Closed)
        ));
        assert!(broker.is_closed());
    }
}
