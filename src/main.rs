//! Stream Daemon - Main Entry Point
//!
//! Consumes the topics behind the given worker bindings and dispatches each
//! message to its worker until INT/TERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventstream::daemon::signals;
use eventstream::workers::builtin_registry;
use eventstream::{
    AppIdentity, BrokerConfig, ConsumerDaemon, DaemonExit, DaemonSettings, KafkaBroker,
    TracingReporter,
};

#[derive(Debug, Parser)]
#[command(name = "stream-daemon", version, about = "Kafka consumer daemon")]
struct Cli {
    /// Worker binding ids, e.g. `event_log`
    #[arg(required = true)]
    bindings: Vec<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "eventstream=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let identity = AppIdentity::from_env().context("loading application identity")?;
    let config = BrokerConfig::from_env(&identity).context("loading broker configuration")?;

    info!(
        app = %identity.name,
        version = %identity.version,
        brokers = %config.bootstrap_servers(),
        "Starting stream daemon"
    );

    let settings = DaemonSettings::from(&config);
    let broker = Arc::new(KafkaBroker::new(config));
    let registry = builtin_registry();

    let mut daemon = ConsumerDaemon::start(
        &cli.bindings,
        &registry,
        broker.clone(),
        Arc::new(TracingReporter),
        settings,
    )
    .context("starting consumer daemon")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = signals::spawn_listener(daemon.signal_hooks(), shutdown_tx)
        .context("installing signal handlers")?;

    let exit = daemon.run(shutdown_rx).await;
    listener.abort();

    // Flushes the producer, if one was ever created.
    drop(daemon);
    drop(broker);

    match exit {
        DaemonExit::Drained => {
            info!("Stream daemon stopped");
            Ok(())
        }
        DaemonExit::Unhealthy { ref binding } => {
            error!(binding = %binding, "Stream daemon stopped on unhealthy infrastructure");
            std::process::exit(exit.code());
        }
    }
}
