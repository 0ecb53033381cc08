//! Consumer daemon.
//!
//! Polls the subscribed topics, hands each message to the worker bound to
//! its topic and decides whether to commit it:
//!
//! - success: commit
//! - undecodable payload or ordinary worker error: report, then commit so a
//!   poison message cannot stall its partition
//! - worker error classified as transient infrastructure failure: stop
//!   without committing, the message is redelivered after restart
//!
//! Dispatch is strictly sequential. The next poll starts only after the
//! current message's commit decision is made, which gives in-order,
//! at-least-once processing per partition. Worker calls have no timeout.

pub mod signals;

pub use signals::{HookSet, OperatorSignal};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::messaging::{BrokerError, CommitMode, MessageConsumer};
use crate::reporting::ErrorReporter;
use crate::types::{BrokerConfig, InboundMessage, Payload};
use crate::workers::{RegistryError, Worker, WorkerRegistry};
use crate::DEFAULT_POLL_TIMEOUT_MS;

/// Lifecycle of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Subscribed,
    Polling,
    Dispatching,
    Draining,
    Stopped,
}

/// How the daemon loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonExit {
    /// Shutdown was requested and the consumer was closed.
    Drained,
    /// A worker's backing store is unreachable. The message that hit it was
    /// not committed.
    Unhealthy { binding: String },
}

impl DaemonExit {
    /// Process exit status for this outcome.
    pub fn code(&self) -> i32 {
        match self {
            Self::Drained => 0,
            Self::Unhealthy { .. } => 1,
        }
    }
}

/// Errors raised while starting the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("bindings must be provided")]
    NoBindings,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("bindings `{first}` and `{second}` both consume topic `{topic}`")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Loop settings.
#[derive(Debug, Clone, Copy)]
pub struct DaemonSettings {
    pub poll_timeout: Duration,
    pub commit_mode: CommitMode,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            commit_mode: CommitMode::Async,
        }
    }
}

impl From<&BrokerConfig> for DaemonSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            commit_mode: config.commit_mode,
        }
    }
}

/// One worker bound to one topic.
struct Binding {
    id: String,
    topic: String,
    worker: Arc<dyn Worker>,
}

/// Outcome of handing one message to its worker.
enum Dispatch {
    Processed,
    Failed(anyhow::Error),
    Unhealthy(anyhow::Error),
}

/// The consumer daemon.
pub struct ConsumerDaemon {
    consumer: Arc<dyn MessageConsumer>,
    reporter: Arc<dyn ErrorReporter>,
    settings: DaemonSettings,
    bindings: Vec<Binding>,
    routes: HashMap<String, usize>,
    state: DaemonState,
}

impl fmt::Debug for ConsumerDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDaemon")
            .field("state", &self.state)
            .field("topics", &self.topics())
            .finish()
    }
}

impl ConsumerDaemon {
    /// Resolve a worker for every binding id and subscribe to their topics.
    pub fn start(
        binding_ids: &[String],
        registry: &WorkerRegistry,
        consumer: Arc<dyn MessageConsumer>,
        reporter: Arc<dyn ErrorReporter>,
        settings: DaemonSettings,
    ) -> Result<Self, DaemonError> {
        if binding_ids.is_empty() {
            return Err(DaemonError::NoBindings);
        }

        let mut bindings: Vec<Binding> = Vec::with_capacity(binding_ids.len());
        let mut routes = HashMap::new();

        for id in binding_ids {
            let resolved = registry.resolve(id)?;
            if let Some(&existing) = routes.get(&resolved.topic) {
                let first: &Binding = &bindings[existing];
                return Err(DaemonError::DuplicateTopic {
                    topic: resolved.topic,
                    first: first.id.clone(),
                    second: resolved.id,
                });
            }
            routes.insert(resolved.topic.clone(), bindings.len());
            bindings.push(Binding {
                id: resolved.id,
                topic: resolved.topic,
                worker: resolved.worker,
            });
        }

        let mut daemon = Self {
            consumer,
            reporter,
            settings,
            bindings,
            routes,
            state: DaemonState::Starting,
        };

        let topics = daemon.topics();
        daemon.consumer.subscribe(&topics)?;
        daemon.transition(DaemonState::Subscribed);

        info!(
            bindings = ?binding_ids,
            topics = ?topics,
            "Consumer daemon subscribed"
        );

        Ok(daemon)
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Topics consumed, in binding order.
    pub fn topics(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.topic.clone()).collect()
    }

    /// Signal hooks of every bound worker.
    pub fn signal_hooks(&self) -> HookSet {
        HookSet::new(
            self.bindings
                .iter()
                .map(|b| (b.id.clone(), b.worker.signal_hooks()))
                .filter(|(_, hooks)| !hooks.is_empty())
                .collect(),
        )
    }

    fn transition(&mut self, next: DaemonState) {
        debug!(from = ?self.state, to = ?next, "Daemon state transition");
        self.state = next;
    }

    /// Run until shutdown is requested or a worker reports an unreachable
    /// backing store.
    ///
    /// Shutdown is requested by sending `true` on the channel, or by
    /// dropping its sender. It is checked before every poll and interrupts
    /// a poll in progress; a worker call in progress always completes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> DaemonExit {
        self.transition(DaemonState::Polling);
        info!("Consumer daemon polling");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.consumer.poll(self.settings.poll_timeout) => polled,
            };

            let message = match polled {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(BrokerError::Closed) => {
                    warn!("Consumer closed underneath the daemon");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Kafka consumer error");
                    // Back off for one poll interval, still honoring shutdown.
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                    }
                    continue;
                }
            };

            self.transition(DaemonState::Dispatching);
            match self.dispatch(&message).await {
                Dispatch::Processed => self.commit(&message),
                Dispatch::Failed(err) => {
                    self.reporter.report(&*err);
                    self.commit(&message);
                }
                Dispatch::Unhealthy(err) => {
                    let binding = self.binding_for(&message.topic).unwrap_or_default();
                    error!(
                        db = "unhealthy",
                        binding = %binding,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %err,
                        "Backing store unreachable, stopping without commit"
                    );
                    self.drain();
                    return DaemonExit::Unhealthy { binding };
                }
            }
            self.transition(DaemonState::Polling);
        }

        self.drain();
        DaemonExit::Drained
    }

    fn binding_for(&self, topic: &str) -> Option<String> {
        self.routes
            .get(topic)
            .map(|&index| self.bindings[index].id.clone())
    }

    async fn dispatch(&self, message: &InboundMessage) -> Dispatch {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Received message"
        );

        let Some(&index) = self.routes.get(&message.topic) else {
            return Dispatch::Failed(anyhow::anyhow!(
                "no worker bound to topic `{}`",
                message.topic
            ));
        };
        let binding = &self.bindings[index];

        let payload = match decode(message) {
            Ok(payload) => payload,
            Err(err) => return Dispatch::Failed(err),
        };

        match binding.worker.process(payload).await {
            Ok(()) => Dispatch::Processed,
            Err(err) if binding.worker.is_transient_infra_error(&err) => Dispatch::Unhealthy(err),
            Err(err) => Dispatch::Failed(err.context(format!(
                "worker `{}` failed on {}[{}]@{}",
                binding.id, message.topic, message.partition, message.offset
            ))),
        }
    }

    fn commit(&self, message: &InboundMessage) {
        if let Err(e) = self.consumer.commit(message, self.settings.commit_mode) {
            error!(error = %e, "Failed to commit offset");
        }
    }

    fn drain(&mut self) {
        self.transition(DaemonState::Draining);
        self.consumer.close();
        self.transition(DaemonState::Stopped);
        info!("Consumer daemon stopped");
    }
}

fn decode(message: &InboundMessage) -> anyhow::Result<Payload> {
    let payload: Payload = serde_json::from_slice(&message.payload).with_context(|| {
        format!(
            "failed to decode payload on {}[{}]@{}",
            message.topic, message.partition, message.offset
        )
    })?;
    debug!(payload = %serde_json::Value::Object(payload.clone()), "Decoded payload");
    Ok(payload)
}
