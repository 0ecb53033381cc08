//! Event notification pipeline.
//!
//! Entity mutations become `model.<kind>.<verb>` events (see `mediator`),
//! which are threaded through an ordered chain of middlewares (see
//! `pipeline`). The default chain stamps the event name into the payload,
//! wraps it in a signed envelope, traces it and publishes it to
//! `<app>.events.<namespace>` keyed by the event name.

pub mod jwt;
pub mod mediator;
pub mod middlewares;
pub mod pipeline;

pub use jwt::{EnvelopeClaims, EnvelopeSigner, SigningError};
pub use mediator::{EventMediator, EventSettings, Eventable, Mutation, Trigger};
pub use middlewares::{
    default_middlewares, GenerateJwt, IncludeEventMetadata, PrintToScreen, PublishToBroker,
};
pub use pipeline::{EventPipeline, Flow, Halted, Middleware, PipelineError};

use std::sync::Arc;

use crate::messaging::MessagePublisher;
use crate::reporting::ErrorReporter;
use crate::types::{AppIdentity, SigningConfig};

/// Build the default pipeline for `identity`, signing with `signing` and
/// publishing through `publisher`.
pub fn default_pipeline(
    identity: &AppIdentity,
    signing: &SigningConfig,
    publisher: Arc<dyn MessagePublisher>,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<EventPipeline, SigningError> {
    let signer = EnvelopeSigner::new(identity.name.clone(), signing)?;
    Ok(EventPipeline::with_middlewares(
        reporter,
        default_middlewares(&identity.name, signer, publisher),
    ))
}
