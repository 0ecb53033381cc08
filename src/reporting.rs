//! Error reporting sink.
//!
//! Errors the daemon and pipeline contain (rather than propagate) are handed
//! to an `ErrorReporter` exactly once.

use std::error::Error;

use tracing::error;

/// Accepts arbitrary errors for reporting.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &(dyn Error + 'static));
}

/// Reporter that logs the error and its source chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &(dyn Error + 'static)) {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        error!(error = %err, causes = ?causes, "Reported error");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Reporter that remembers every message it was handed.
    #[derive(Default)]
    pub struct RecordingReporter {
        reports: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub fn reports(&self) -> Vec<String> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &(dyn Error + 'static)) {
            self.reports.lock().unwrap().push(error.to_string());
        }
    }
}
