//! Eventstream Library
//!
//! Publishes domain-model changes as signed events to Kafka and runs the
//! consumer daemon that dispatches inbound messages to pluggable workers.

pub mod daemon;
pub mod events;
pub mod messaging;
pub mod reporting;
pub mod types;
pub mod workers;

pub use daemon::{ConsumerDaemon, DaemonExit, DaemonSettings, DaemonState};
pub use events::{EventMediator, EventPipeline, Eventable, Flow, Middleware};
pub use messaging::{KafkaBroker, MessageConsumer, MessagePublisher};
pub use reporting::{ErrorReporter, TracingReporter};
pub use types::{AppIdentity, BrokerConfig, Event, InboundMessage, SigningConfig};
pub use workers::{Worker, WorkerRegistry};

/// Default bound on a single consumer poll in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// Default bound on producer delivery in milliseconds
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5000;

/// Lifetime of a signed event envelope in seconds
pub const ENVELOPE_TTL_SECS: i64 = 60;
