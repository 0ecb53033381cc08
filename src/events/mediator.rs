//! Turns entity mutations into `model.<kind>.<verb>` events.
//!
//! The persistence layer calls `EventMediator::after_commit` once a create
//! or update is committed. Nothing hooks into entities implicitly.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::pipeline::{EventPipeline, Flow, PipelineError};
use crate::types::Payload;

/// Mutation kinds that can emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Create,
    Update,
}

/// Per-type event settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSettings {
    /// Entity token used in event names. Defaults to the normalized type
    /// name.
    pub kind: Option<String>,

    /// Mutations that emit events.
    pub on: Vec<Trigger>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            kind: None,
            on: vec![Trigger::Create, Trigger::Update],
        }
    }
}

impl EventSettings {
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn only(mut self, triggers: &[Trigger]) -> Self {
        self.on = triggers.to_vec();
        self
    }

    pub fn fires_on(&self, trigger: Trigger) -> bool {
        self.on.contains(&trigger)
    }
}

/// An entity whose mutations are published as events.
pub trait Eventable: Serialize {
    /// Type name, e.g. `Order` or `admin::UserRole`.
    fn type_name(&self) -> &'static str;

    fn event_settings(&self) -> EventSettings {
        EventSettings::default()
    }

    /// Current field values. Defaults to the serialized entity.
    fn snapshot(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Payload::new(),
        }
    }
}

/// A committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Created,
    /// `previous` maps each changed field to its value before the update.
    Updated { previous: Payload },
}

/// Drop null-valued fields.
pub fn compact(fields: &Payload) -> Payload {
    fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Snake-case a type name: `Admin::UserRole` → `admin_user_role`.
pub fn normalize_kind(type_name: &str) -> String {
    let chars: Vec<char> = type_name.chars().collect();
    let mut out = String::with_capacity(type_name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == ':' || c == '/' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.map_or(false, char::is_lowercase),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Builds entity events and sends them through the pipeline.
#[derive(Debug, Clone)]
pub struct EventMediator {
    pipeline: Arc<EventPipeline>,
}

impl EventMediator {
    pub fn new(pipeline: Arc<EventPipeline>) -> Self {
        Self { pipeline }
    }

    /// Persistence-layer entry point, called after a successful commit.
    /// Returns `None` when the type's settings exclude the mutation or the
    /// update changed nothing.
    pub async fn after_commit<E: Eventable>(
        &self,
        entity: &E,
        mutation: &Mutation,
    ) -> Result<Option<Flow>, PipelineError> {
        let settings = entity.event_settings();
        match mutation {
            Mutation::Created if settings.fires_on(Trigger::Create) => {
                self.notify_created(entity).await.map(Some)
            }
            Mutation::Updated { previous } if settings.fires_on(Trigger::Update) => {
                self.notify_updated(entity, previous).await
            }
            _ => {
                debug!(entity = entity.type_name(), mutation = ?mutation, "Event disabled for mutation");
                Ok(None)
            }
        }
    }

    /// Emit `model.<kind>.<partial_name>` with `payload`.
    pub async fn notify<E: Eventable>(
        &self,
        entity: &E,
        partial_name: &str,
        payload: Payload,
    ) -> Result<Flow, PipelineError> {
        let kind = entity
            .event_settings()
            .kind
            .unwrap_or_else(|| normalize_kind(entity.type_name()));
        let name = format!("model.{}.{}", kind, partial_name);
        self.pipeline.notify(name, payload).await
    }

    /// Emit `model.<kind>.created` with `{record}`.
    pub async fn notify_created<E: Eventable>(&self, entity: &E) -> Result<Flow, PipelineError> {
        let record = compact(&entity.snapshot());
        self.notify(entity, "created", object(json!({ "record": record })))
            .await
    }

    /// Emit `model.<kind>.updated` with `{record, changes}`.
    ///
    /// `previous` maps changed fields to their old values. Nothing is
    /// emitted when it is empty.
    pub async fn notify_updated<E: Eventable>(
        &self,
        entity: &E,
        previous: &Payload,
    ) -> Result<Option<Flow>, PipelineError> {
        if previous.is_empty() {
            return Ok(None);
        }

        let current = entity.snapshot();
        let mut before = current.clone();
        for (field, value) in previous {
            before.insert(field.clone(), value.clone());
        }

        // Timestamps missing from the old state are taken from the current
        // creation time. Entities without the field are left alone.
        let created_at = current.get("created_at").cloned().unwrap_or(Value::Null);
        for field in ["created_at", "updated_at"] {
            let missing = current.contains_key(field)
                && before.get(field).map_or(true, Value::is_null);
            if missing && !created_at.is_null() {
                before.insert(field.to_string(), created_at.clone());
            }
        }

        let after = compact(&current);
        let mut changes = compact(&before);
        changes.retain(|field, value| after.get(field) != Some(&*value));

        self.notify(
            entity,
            "updated",
            object(json!({ "record": after, "changes": changes })),
        )
        .await
        .map(Some)
    }
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
