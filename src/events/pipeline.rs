//! Ordered, short-circuiting chain of event middlewares.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::jwt::SigningError;
use crate::messaging::BrokerError;
use crate::reporting::ErrorReporter;
use crate::types::{DeliveryReceipt, Event, Payload};

/// Errors that abort a `notify` call.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to sign event: {0}")]
    Signing(#[from] SigningError),

    #[error("failed to publish event: {0}")]
    Publish(#[from] BrokerError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Value that ended the pipeline early.
#[derive(Debug, Clone, PartialEq)]
pub enum Halted {
    /// The event was handed to the broker.
    Published(DeliveryReceipt),
    /// A middleware decided the event goes nowhere.
    Dropped(String),
}

/// Result of one middleware step, and of the pipeline as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand this event to the next middleware. Returned by `notify` when
    /// every middleware continued.
    Continue(Event),
    /// Stop here with this value.
    Halt(Halted),
}

/// One stage of the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, event: Event) -> Result<Flow, PipelineError>;
}

/// The middleware chain events are published through.
pub struct EventPipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("middlewares", &self.names())
            .finish()
    }
}

impl EventPipeline {
    /// Empty pipeline.
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            middlewares: Vec::new(),
            reporter,
        }
    }

    pub fn with_middlewares(
        reporter: Arc<dyn ErrorReporter>,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        Self {
            middlewares,
            reporter,
        }
    }

    /// Append a middleware to the end of the chain.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Insert a middleware at `index`.
    ///
    /// # Panics
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.insert(index, middleware);
        self
    }

    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Middleware names in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Thread `(name, payload)` through the chain.
    ///
    /// Returns the first `Flow::Halt`, or `Flow::Continue` with the final
    /// event if every middleware continued. A failing middleware is reported
    /// and its error returned; the rest of the chain is skipped.
    pub async fn notify(
        &self,
        name: impl Into<String>,
        payload: Payload,
    ) -> Result<Flow, PipelineError> {
        let mut event = Event::new(name, payload);

        for middleware in &self.middlewares {
            match middleware.call(event).await {
                Ok(Flow::Continue(next)) => event = next,
                Ok(halt @ Flow::Halt(_)) => {
                    debug!(middleware = middleware.name(), "Pipeline halted");
                    return Ok(halt);
                }
                Err(err) => {
                    error!(middleware = middleware.name(), error = %err, "Middleware failed");
                    self.reporter.report(&err);
                    return Err(err);
                }
            }
        }

        Ok(Flow::Continue(event))
    }
}
