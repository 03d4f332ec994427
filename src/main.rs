//! Queue engine - token scheduling for multi-counter service offices
//!
//! Citizens join per-service queues, staff call tokens to counters, and
//! unanswered calls expire to NO_SHOW. Notification intents are written for
//! an external notifier to deliver.
//!
//! Module structure:
//! - `domain/` - Core types (Token, Service, Counter, errors)
//! - `io/` - External interfaces (intent log, estimator, snapshot, Prometheus)
//! - `services/` - Business logic (TokenStore, scheduler, dispatcher, engine)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use queue_engine::infra::{Config, Metrics};
use queue_engine::io::{create_intent_channel, EngineSnapshot, HttpWaitTimeEstimator, IntentLogWriter};
use queue_engine::services::no_show::run_sweeper;
use queue_engine::services::{QueueEngine, WaitTimeEstimator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Queue engine - priority token scheduling with no-show handling
#[derive(Parser, Debug)]
#[command(name = "queue-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-token visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "queue-engine starting");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        services = %config.services().len(),
        counters = %config.counters().len(),
        no_show_timeout_secs = %config.no_show_timeout_secs(),
        nearly_up_position = %config.nearly_up_position(),
        estimator_url = ?config.estimator_url(),
        intent_file = %config.intent_file(),
        snapshot_file = ?config.snapshot_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Intent channel and its JSONL consumer
    let (intent_sender, intent_rx) = create_intent_channel(
        config.intent_channel_capacity(),
        config.site_id().to_string(),
        metrics.clone(),
    );
    let intent_log = IntentLogWriter::new(config.intent_file(), intent_rx);
    let intent_log_shutdown = shutdown_rx.clone();
    let intent_log_task = tokio::spawn(async move {
        intent_log.run(intent_log_shutdown).await;
    });

    // Optional external wait-time estimator
    let estimator: Option<Arc<dyn WaitTimeEstimator>> = match config.estimator_url() {
        Some(url) => {
            match HttpWaitTimeEstimator::new(url, Duration::from_millis(config.estimator_timeout_ms())) {
                Ok(estimator) => Some(Arc::new(estimator)),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "wait_estimator_disabled");
                    None
                }
            }
        }
        None => None,
    };

    let engine = Arc::new(QueueEngine::from_config(&config, metrics.clone(), Some(intent_sender), estimator)?);

    // Restore persisted state on top of the configured layout
    if let Some(path) = config.snapshot_file() {
        match EngineSnapshot::load(path) {
            Ok(Some(snapshot)) => engine.restore(snapshot),
            Ok(None) => info!(file = %path, "snapshot_absent_starting_empty"),
            Err(e) => error!(error = %format!("{e:#}"), "snapshot_load_failed_starting_empty"),
        }
    }

    // No-show deadline sweep
    let sweeper_engine = engine.clone();
    let sweeper_shutdown = shutdown_rx.clone();
    let sweep_interval = Duration::from_millis(config.sweep_interval_ms().max(1));
    tokio::spawn(async move {
        run_sweeper(sweeper_engine, sweep_interval, sweeper_shutdown).await;
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_engine = engine.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = queue_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_engine,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let reporter_engine = engine.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let waiting = reporter_engine.live_counts().iter().map(|c| c.waiting).sum();
                    let pending = reporter_engine.no_show_monitor().pending();
                    reporter_engine.metrics().report(waiting, pending).log();
                }
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    info!(services = ?engine.service_ids(), "engine_started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    if let Some(path) = config.snapshot_file() {
        if let Err(e) = engine.snapshot().save(path) {
            error!(error = %format!("{e:#}"), "snapshot_save_failed");
        }
    }

    // Let the intent log drain what is already queued
    drop(engine);
    if let Err(e) = intent_log_task.await {
        warn!(error = %e, "intent_log_task_failed");
    }

    info!("queue-engine shutdown complete");
    Ok(())
}
