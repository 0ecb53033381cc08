//! Registry mapping binding ids to worker constructors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::Worker;

/// Constructor for a worker.
pub type WorkerFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn Worker>> + Send + Sync>;

/// Errors raised while resolving a binding id.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no worker registered for binding `{0}`")]
    UnknownBinding(String),

    #[error("failed to construct worker for binding `{id}`: {source}")]
    Construction {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

struct Entry {
    topic: String,
    factory: WorkerFactory,
}

/// A worker built for a binding, with the topic it consumes.
pub struct ResolvedWorker {
    pub id: String,
    pub topic: String,
    pub worker: Arc<dyn Worker>,
}

/// Explicit registry of worker constructors, populated at startup.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: HashMap<String, Entry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker consuming the topic named after its binding id.
    pub fn register<F>(&mut self, id: &str, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        self.register_on_topic(id, id, factory)
    }

    /// Register a worker consuming `topic`.
    pub fn register_on_topic<F>(&mut self, id: &str, topic: &str, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        self.entries.insert(
            id.to_string(),
            Entry {
                topic: topic.to_string(),
                factory: Box::new(factory),
            },
        );
        self
    }

    /// Build the worker for `id`.
    pub fn resolve(&self, id: &str) -> Result<ResolvedWorker, RegistryError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RegistryError::UnknownBinding(id.to_string()))?;

        let worker = (entry.factory)().map_err(|source| RegistryError::Construction {
            id: id.to_string(),
            source,
        })?;

        debug!(binding = %id, topic = %entry.topic, "Worker resolved");

        Ok(ResolvedWorker {
            id: id.to_string(),
            topic: entry.topic.clone(),
            worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Worker for Noop {
        async fn process(&self, _payload: Payload) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_transient_infra_error(&self, _error: &anyhow::Error) -> bool {
            false
        }
    }

    #[test]
    fn test_resolve_uses_binding_as_default_topic() {
        let mut registry = WorkerRegistry::new();
        registry.register("deposit_coin", || Ok(Arc::new(Noop) as Arc<dyn Worker>));

        let resolved = registry.resolve("deposit_coin").unwrap();
        assert_eq!(resolved.id, "deposit_coin");
        assert_eq!(resolved.topic, "deposit_coin");
    }

    #[test]
    fn test_resolve_custom_topic() {
        let mut registry = WorkerRegistry::new();
        registry.register_on_topic("matching", "peatio.events.order", || {
            Ok(Arc::new(Noop) as Arc<dyn Worker>)
        });

        assert_eq!(registry.resolve("matching").unwrap().topic, "peatio.events.order");
    }

    #[test]
    fn test_unknown_binding_fails() {
        let registry = WorkerRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::UnknownBinding(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_construction_failure_is_wrapped() {
        let mut registry = WorkerRegistry::new();
        registry.register("broken", || Err(anyhow::anyhow!("no database url")));

        let err = registry.resolve("broken").err().unwrap();
        assert!(matches!(err, RegistryError::Construction { .. }));
        assert!(err.to_string().contains("no database url"));
    }
}
