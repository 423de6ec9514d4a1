//! Storesight - retail video analytics engine
//!
//! Turns per-camera detection streams into hourly store analytics:
//! entrance counts, section dwell times, queue estimates, and
//! hour-bucketed aggregates flushed crash-safely to storage.
//!
//! Module structure:
//! - `domain/` - Core business types (Track, DwellRecord, HourlyBucket)
//! - `io/` - External interfaces (replay sources, persistence gateway, spill)
//! - `services/` - Business logic (Tracker, pipelines, Aggregator)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use storesight::infra::{Config, Metrics};
use storesight::io::{DetectionSource, JsonlGateway, JsonlReplay};
use storesight::services::{Aggregator, FeedPipeline};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Storesight - retail video analytics engine
#[derive(Parser, Debug)]
#[command(name = "storesight", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then
    /// config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging, level via RUST_LOG (default INFO)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("storesight starting");

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("CONFIG_FILE").ok())
        .unwrap_or_else(|| "config/dev.toml".to_string());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        feeds = %config.feeds().len(),
        iou_threshold = %config.tracker().iou_threshold,
        miss_limit = %config.tracker().miss_limit,
        grace_ms = %config.tracker().grace_ms,
        min_dwell_secs = %config.dwell().min_dwell_secs,
        busy_threshold = %config.queue().busy_threshold,
        flush_interval_s = %config.aggregator().flush_interval_secs,
        "config_loaded"
    );

    if config.feeds().is_empty() {
        warn!("no feeds configured, nothing to process");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        let mut window_start = std::time::Instant::now();
        loop {
            interval.tick().await;
            let summary = metrics_clone.report(window_start);
            window_start = std::time::Instant::now();
            summary.log();
        }
    });

    // Aggregator consumes all feed events over one bounded channel
    let gateway = Arc::new(JsonlGateway::new(config.egress()));
    let (event_tx, event_rx) = mpsc::channel(config.pipeline().channel_capacity);
    let aggregator =
        Aggregator::new(config.aggregator().clone(), gateway, metrics.clone());
    let aggregator_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(aggregator.run(event_rx, shutdown))
    };

    // One pipeline task per configured feed
    let mut pipelines = JoinSet::new();
    for feed in config.feeds() {
        let replay_file = feed
            .replay_file
            .clone()
            .with_context(|| format!("feed '{}' has no replay_file", feed.id))?;
        let source = JsonlReplay::open(&replay_file)
            .with_context(|| format!("feed '{}' source", feed.id))?;

        let pipeline =
            FeedPipeline::new(feed.clone(), &config, event_tx.clone(), metrics.clone())?;
        let shutdown = shutdown_rx.clone();
        pipelines.spawn(async move {
            pipeline.run(Box::new(source) as Box<dyn DetectionSource>, shutdown).await;
        });
    }
    // The aggregator's channel closes when the last pipeline drops its sender
    drop(event_tx);

    // Shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    while let Some(result) = pipelines.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "pipeline_task_failed");
        }
    }

    // Final flush happens inside the aggregator's shutdown path
    if let Err(e) = aggregator_task.await {
        error!(error = %e, "aggregator_task_failed");
    }

    info!("storesight shutdown complete");
    Ok(())
}
