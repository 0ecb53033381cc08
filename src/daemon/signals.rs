//! Process signal handling for the daemon.
//!
//! `INT` and `TERM` request a drain through the shutdown channel. `USR1` and
//! `USR2` are fanned out to the workers' hooks and never touch daemon state.

use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::workers::SignalHooks;

/// Operator signal forwarded to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSignal {
    User1,
    User2,
}

impl fmt::Display for OperatorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User1 => f.write_str("USR1"),
            Self::User2 => f.write_str("USR2"),
        }
    }
}

/// Signal hooks of every bound worker, keyed by binding id.
#[derive(Debug, Clone, Default)]
pub struct HookSet {
    hooks: Vec<(String, SignalHooks)>,
}

impl HookSet {
    pub fn new(hooks: Vec<(String, SignalHooks)>) -> Self {
        Self { hooks }
    }

    /// Run the hook for `signal` on every worker that has one. Returns how
    /// many hooks ran.
    pub fn fan_out(&self, signal: OperatorSignal) -> usize {
        let mut invoked = 0;
        for (binding, hooks) in &self.hooks {
            let hook = match signal {
                OperatorSignal::User1 => hooks.on_user1.as_ref(),
                OperatorSignal::User2 => hooks.on_user2.as_ref(),
            };
            match hook {
                Some(hook) => {
                    debug!(binding = %binding, signal = %signal, "Running worker hook");
                    hook();
                    invoked += 1;
                }
                None => debug!(binding = %binding, signal = %signal, "Worker has no hook"),
            }
        }
        invoked
    }
}

/// Install the signal handlers and spawn the task that serves them.
///
/// The task ends after the first `INT`/`TERM`, dropping `shutdown` once it
/// has sent `true`.
#[cfg(unix)]
pub fn spawn_listener(
    hooks: HookSet,
    shutdown: watch::Sender<bool>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut user2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("INT received, draining");
                    break;
                }
                _ = terminate.recv() => {
                    info!("TERM received, draining");
                    break;
                }
                _ = user1.recv() => {
                    info!("USR1 received.");
                    hooks.fan_out(OperatorSignal::User1);
                }
                _ = user2.recv() => {
                    info!("USR2 received.");
                    hooks.fan_out(OperatorSignal::User2);
                }
            }
        }
        let _ = shutdown.send(true);
    }))
}

/// Install the signal handlers and spawn the task that serves them.
///
/// Only Ctrl-C is available off Unix; operator hooks are never invoked.
#[cfg(not(unix))]
pub fn spawn_listener(
    hooks: HookSet,
    shutdown: watch::Sender<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let _ = hooks;
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, draining");
        }
        let _ = shutdown.send(true);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fan_out_skips_missing_hooks() {
        let user1_calls = Arc::new(AtomicUsize::new(0));
        let user2_calls = Arc::new(AtomicUsize::new(0));

        let counter1 = Arc::clone(&user1_calls);
        let counter2 = Arc::clone(&user2_calls);
        let hooks = HookSet::new(vec![
            (
                "with_both".to_string(),
                SignalHooks::none()
                    .on_user1(move || {
                        counter1.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_user2(move || {
                        counter2.fetch_add(1, Ordering::SeqCst);
                    }),
            ),
            ("without".to_string(), SignalHooks::none()),
        ]);

        assert_eq!(hooks.fan_out(OperatorSignal::User1), 1);
        assert_eq!(hooks.fan_out(OperatorSignal::User1), 1);
        assert_eq!(hooks.fan_out(OperatorSignal::User2), 1);

        assert_eq!(user1_calls.load(Ordering::SeqCst), 2);
        assert_eq!(user2_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fan_out_with_no_workers() {
        assert_eq!(HookSet::default().fan_out(OperatorSignal::User2), 0);
    }
}
