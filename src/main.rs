//! Geofence monitor - attendance entry/exit detection service
//!
//! Evaluates subject positions against the organization's geofences and
//! emits Entry/Exit attendance events.
//!
//! Module structure:
//! - `domain/` - Core value types (Coordinate, Geofence, events) and distance
//! - `io/` - External interfaces (position sources, ingest, sinks, Prometheus)
//! - `services/` - Business logic (catalog, evaluator, transitions, sessions)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use geofence_attendance::infra::{Config, Metrics, SinkMode};
use geofence_attendance::io::catalog_feed::reload_catalog;
use geofence_attendance::io::{
    load_replay, run_catalog_refresh, start_position_listener, AttendanceSink, HttpSink, JsonlSink,
    LogSink, ReplayPositionSource, SubjectRouter,
};
use geofence_attendance::services::{GeofenceCatalog, Monitor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofence monitor - attendance entry/exit detection
#[derive(Parser, Debug)]
#[command(name = "geofence-monitor", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Replay a recorded JSONL capture instead of listening for devices
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Delay between replayed fixes per subject
    #[arg(long, default_value_t = 0)]
    pace_ms: u64,
}

fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn AttendanceSink>> {
    let sink: Arc<dyn AttendanceSink> = match config.sink_mode() {
        SinkMode::Log => Arc::new(LogSink),
        SinkMode::File => Arc::new(JsonlSink::new(config.sink_file())),
        SinkMode::Http => Arc::new(
            HttpSink::new(config.sink_http_url(), config.sink_timeout())
                .context("failed to build HTTP sink")?,
        ),
    };
    Ok(sink)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-sample visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "geofence-monitor starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        catalog_file = %config.catalog_file().display(),
        sink_mode = %config.sink_mode().as_str(),
        min_dwell_ms = %config.min_dwell_ms(),
        listener_port = %config.listener_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Initial catalog load; an unreadable file starts with an empty catalog
    let catalog = Arc::new(GeofenceCatalog::new());
    let catalog_path = config.catalog_file();
    if let Err(e) = reload_catalog(&catalog, &catalog_path, &metrics) {
        warn!(error = %format!("{e:#}"), "catalog_initial_load_failed");
    }

    let sink = build_sink(&config)?;
    let monitor = Arc::new(Monitor::new(
        catalog.clone(),
        sink,
        metrics.clone(),
        config.tracking_settings(),
    ));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = geofence_attendance::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
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
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    match args.replay {
        Some(path) => run_replay(&monitor, &config, &path, Duration::from_millis(args.pace_ms)).await?,
        None => run_live(&monitor, &config, catalog, catalog_path, metrics.clone(), shutdown_rx).await,
    }

    let _ = shutdown_tx.send(true);
    metrics.report().log();
    info!("geofence-monitor shutdown complete");
    Ok(())
}

/// One session per subject in the capture; returns when all have ended
async fn run_replay(monitor: &Monitor, config: &Config, path: &Path, pace: Duration) -> anyhow::Result<()> {
    let captures = load_replay(path)?;
    let options = config.source_options();

    let mut handles = Vec::with_capacity(captures.len());
    for capture in captures {
        let subject_id = capture.subject_id.clone();
        let source = ReplayPositionSource::from(capture)
            .with_pace(pace)
            .with_metrics(monitor.metrics().clone());
        let handle = monitor
            .start_monitoring(subject_id.clone(), source, &options)
            .with_context(|| format!("failed to start replay session for {subject_id}"))?;
        handles.push(handle);
    }

    for handle in handles {
        let subject_id = handle.subject().clone();
        match handle.wait().await {
            Ok(exit) => info!(subject_id = %subject_id, exit = ?exit, "replay_session_finished"),
            Err(e) => error!(subject_id = %subject_id, error = %e, "replay_session_failed"),
        }
    }
    Ok(())
}

/// Catalog refresh plus device ingest until Ctrl+C
async fn run_live(
    monitor: &Arc<Monitor>,
    config: &Config,
    catalog: Arc<GeofenceCatalog>,
    catalog_path: PathBuf,
    metrics: Arc<Metrics>,
    shutdown_rx: watch::Receiver<bool>,
) {
    if let Some(interval) = config.catalog_refresh_interval() {
        let refresh_metrics = metrics.clone();
        let refresh_shutdown = shutdown_rx.clone();
        tokio::spawn(run_catalog_refresh(catalog, catalog_path, interval, refresh_metrics, refresh_shutdown));
    }

    let router = Arc::new(SubjectRouter::new(
        monitor.clone(),
        config.source_options(),
        config.feed_capacity(),
    ));

    let listener_config = config.listener_config();
    let listener_router = router.clone();
    let listener_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_position_listener(listener_config, listener_router, metrics, listener_shutdown).await
        {
            error!(error = %e, "Position listener error");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    for (subject_id, exit) in router.shutdown_all().await {
        if let Err(e) = exit {
            warn!(subject_id = %subject_id, error = %e, "session_stop_failed");
        }
    }
}
