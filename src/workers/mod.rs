//! Worker contract and registry.
//!
//! A worker is the processing unit bound to one subscription. The daemon
//! hands it each decoded payload from its topic and asks it to classify the
//! errors it returns.

mod event_log;
mod registry;

pub use event_log::EventLogWorker;
pub use registry::{RegistryError, ResolvedWorker, WorkerFactory, WorkerRegistry};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::Payload;

/// Callback run when the operator sends a signal to the daemon.
pub type SignalHook = Arc<dyn Fn() + Send + Sync>;

/// Optional operator-signal hooks a worker exposes.
///
/// A missing hook means the worker ignores that signal.
#[derive(Clone, Default)]
pub struct SignalHooks {
    pub on_user1: Option<SignalHook>,
    pub on_user2: Option<SignalHook>,
}

impl SignalHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_user1(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_user1 = Some(Arc::new(hook));
        self
    }

    pub fn on_user2(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_user2 = Some(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_user1.is_none() && self.on_user2.is_none()
    }
}

impl fmt::Debug for SignalHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHooks")
            .field("on_user1", &self.on_user1.is_some())
            .field("on_user2", &self.on_user2.is_some())
            .finish()
    }
}

/// Processing unit bound to one subscription.
///
/// Workers live for the whole process. `process` takes `&self`, so workers
/// that keep state use interior mutability; signal hooks may run
/// concurrently with `process`.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Perform the side effect for one decoded message.
    async fn process(&self, payload: Payload) -> anyhow::Result<()>;

    /// Whether `error` means the worker's backing store is unreachable.
    ///
    /// Such errors stop the daemon without committing the message, so it is
    /// redelivered once the daemon is restarted.
    fn is_transient_infra_error(&self, error: &anyhow::Error) -> bool;

    /// Hooks for the operator signals. None by default.
    fn signal_hooks(&self) -> SignalHooks {
        SignalHooks::none()
    }
}

/// Registry holding the workers this crate ships with.
pub fn builtin_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(EventLogWorker::BINDING, || {
        Ok(Arc::new(EventLogWorker::new()) as Arc<dyn Worker>)
    });
    registry
}
