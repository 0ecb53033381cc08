//! Worker that logs every event it receives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{SignalHooks, Worker};
use crate::types::Payload;

/// Logs each payload and counts them. `USR1` dumps the counter.
#[derive(Debug, Default)]
pub struct EventLogWorker {
    processed: Arc<AtomicU64>,
}

impl EventLogWorker {
    /// Binding id under which the worker is registered
    pub const BINDING: &'static str = "event_log";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Worker for EventLogWorker {
    async fn process(&self, payload: Payload) -> anyhow::Result<()> {
        let name = payload
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>");
        info!(event = %name, fields = payload.len(), "Event received");

        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_transient_infra_error(&self, _error: &anyhow::Error) -> bool {
        // No backing store.
        false
    }

    fn signal_hooks(&self) -> SignalHooks {
        let processed = Arc::clone(&self.processed);
        SignalHooks::none().on_user1(move || {
            info!(
                worker = EventLogWorker::BINDING,
                processed = processed.load(Ordering::Relaxed),
                "Worker stats"
            );
        })
    }
}
