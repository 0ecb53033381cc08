//! Default middlewares.
//!
//! To keep the event moving a middleware returns `Flow::Continue`; to stop
//! it returns `Flow::Halt`. The default chain, in order:
//! `IncludeEventMetadata`, `GenerateJwt`, `PrintToScreen`, `PublishToBroker`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::jwt::EnvelopeSigner;
use super::pipeline::{Flow, Halted, Middleware, PipelineError};
use crate::messaging::MessagePublisher;
use crate::types::Event;

/// Copies the event name into the payload under `name`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IncludeEventMetadata;

#[async_trait]
impl Middleware for IncludeEventMetadata {
    fn name(&self) -> &'static str {
        "include_event_metadata"
    }

    async fn call(&self, mut event: Event) -> Result<Flow, PipelineError> {
        event
            .payload
            .insert("name".to_string(), Value::String(event.name.clone()));
        Ok(Flow::Continue(event))
    }
}

/// Replaces the payload with a signed envelope.
#[derive(Debug)]
pub struct GenerateJwt {
    signer: EnvelopeSigner,
}

impl GenerateJwt {
    pub fn new(signer: EnvelopeSigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Middleware for GenerateJwt {
    fn name(&self) -> &'static str {
        "generate_jwt"
    }

    async fn call(&self, event: Event) -> Result<Flow, PipelineError> {
        let envelope = self.signer.sign(event.payload)?;
        Ok(Flow::Continue(Event::new(event.name, envelope)))
    }
}

/// Traces the event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintToScreen;

#[async_trait]
impl Middleware for PrintToScreen {
    fn name(&self) -> &'static str {
        "print_to_screen"
    }

    async fn call(&self, event: Event) -> Result<Flow, PipelineError> {
        debug!(
            at = %Utc::now(),
            name = %event.name,
            payload = %serde_json::Value::Object(event.payload.clone()),
            "Produced new event"
        );
        Ok(Flow::Continue(event))
    }
}

/// Publishes the event and ends the pipeline.
///
/// Topic is `<app>.events.<first segment of the event name>`; the full event
/// name is the message key.
pub struct PublishToBroker {
    application: String,
    publisher: Arc<dyn MessagePublisher>,
}

impl PublishToBroker {
    pub fn new(application: impl Into<String>, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self {
            application: application.into(),
            publisher,
        }
    }

    pub fn topic_for(&self, event: &Event) -> String {
        format!("{}.events.{}", self.application, event.namespace())
    }
}

#[async_trait]
impl Middleware for PublishToBroker {
    fn name(&self) -> &'static str {
        "publish_to_broker"
    }

    async fn call(&self, event: Event) -> Result<Flow, PipelineError> {
        let topic = self.topic_for(&event);
        debug!(topic = %topic, key = %event.name, "Publishing event");

        let bytes = serde_json::to_vec(&event.payload)?;
        let receipt = self
            .publisher
            .produce(&topic, Some(&event.name), &bytes)
            .await?;

        Ok(Flow::Halt(Halted::Published(receipt)))
    }
}

/// The default chain, in order.
pub fn default_middlewares(
    application: &str,
    signer: EnvelopeSigner,
    publisher: Arc<dyn MessagePublisher>,
) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(IncludeEventMetadata),
        Arc::new(GenerateJwt::new(signer)),
        Arc::new(PrintToScreen),
        Arc::new(PublishToBroker::new(application, publisher)),
    ]
}
