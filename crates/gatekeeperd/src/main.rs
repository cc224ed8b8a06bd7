//! Gatekeeper daemon.
//!
//! Loads the governance configuration, runs the periodic sweep and drains
//! approval notifications into the log until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use gatekeeper_core::{
    ChannelNotifier, GovernanceConfig, GovernanceEngine, NotificationEvent, Stores, CONFIG_ENV,
    METRICS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "gatekeeperd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gatekeeper governance daemon", long_about = None)]
struct Args {
    /// Path to the governance configuration (TOML)
    #[arg(short, long, env = CONFIG_ENV, default_value = "gatekeeper.toml")]
    config: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between metric flushes
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    gatekeeper_core::init_tracing(args.json, level);

    let config = GovernanceConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    let (notifier, events) = ChannelNotifier::new();
    let engine = GovernanceEngine::new(config, Stores::in_memory(), Arc::new(notifier))
        .context("Failed to build governance engine")?;
    let drain = spawn_notification_drain(events);

    tracing::info!(
        event = "daemon.started",
        version = gatekeeper_core::VERSION,
        config = %args.config.display(),
    );

    if args.once {
        let report = engine.sweeper().run_once(Utc::now()).await;
        tracing::info!(event = "daemon.sweep_once", errors = report.errors);
        METRICS.flush();
        drop(engine);
        drain.await.context("Notification drain panicked")?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = engine.sweeper().spawn(shutdown_rx.clone());
    let metrics = spawn_metrics_flush(
        Duration::from_secs(args.metrics_interval_secs.max(1)),
        shutdown_rx,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(event = "daemon.stopping");

    shutdown_tx
        .send(true)
        .context("Background tasks exited before shutdown")?;
    sweep.await.context("Sweep task panicked")?;
    metrics.await.context("Metrics task panicked")?;
    drop(engine);
    drain.await.context("Notification drain panicked")?;

    METRICS.flush();
    tracing::info!(event = "daemon.stopped");
    Ok(())
}

/// Log every notification until all senders are gone.
fn spawn_notification_drain(mut events: mpsc::UnboundedReceiver<NotificationEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                event = "approval.notification",
                request_id = %event.request_id,
                environment = %event.environment,
                commit_sha = %event.commit_sha,
                requested_by = %event.requested_by,
                required_approvals = event.required_approvals,
                expires_at = %event.expires_at,
            );
        }
    })
}

fn spawn_metrics_flush(every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => METRICS.flush(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
