//! Domain event flowing through the middleware pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered field map carried by an event.
pub type Payload = Map<String, Value>;

/// A named event with its payload.
///
/// Names are dot-delimited, `namespace.entity.verb`, e.g. `model.order.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// First dot-delimited segment of the name.
    pub fn namespace(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }
}
