//! Prometheus metrics HTTP endpoint
//!
//! Exposes monitor metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads the lifetime view so histogram buckets stay monotonic across
/// scrapes and the periodic log report keeps its own window.
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_sample_metrics(&mut output, site_id, &summary);
    write_event_metrics(&mut output, site_id, &summary);
    write_source_metrics(&mut output, site_id, &summary);
    write_ingest_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);

    output
}

fn write_sample_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_samples_total",
        "Total position samples evaluated",
        MetricType::Counter,
        site,
        summary.samples_total,
    );
    let _ = writeln!(output, "# HELP geofence_samples_per_sec Samples evaluated per second");
    let _ = writeln!(output, "# TYPE geofence_samples_per_sec gauge");
    let _ =
        writeln!(output, "geofence_samples_per_sec{{site=\"{site}\"}} {:.2}", summary.samples_per_sec);

    write_histogram(
        output,
        "geofence_eval_latency_us",
        "Sample evaluation latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_eval_latency_us,
    );
    write_metric(
        output,
        "geofence_eval_latency_p50_us",
        "50th percentile evaluation latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_us,
    );
    write_metric(
        output,
        "geofence_eval_latency_p99_us",
        "99th percentile evaluation latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_entries_total",
        "Entry events emitted",
        MetricType::Counter,
        site,
        summary.entries_total,
    );
    write_metric(
        output,
        "geofence_exits_total",
        "Exit events emitted",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    write_metric(
        output,
        "geofence_sink_failures_total",
        "Events the attendance sink failed to record",
        MetricType::Counter,
        site,
        summary.sink_failures_total,
    );
    write_metric(
        output,
        "geofence_notices_dropped_total",
        "Session notices dropped on a full queue",
        MetricType::Counter,
        site,
        summary.notices_dropped_total,
    );
}

fn write_source_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_stale_samples_total",
        "Fixes dropped for exceeding the maximum sample age",
        MetricType::Counter,
        site,
        summary.stale_samples_total,
    );
    write_metric(
        output,
        "geofence_source_transient_errors_total",
        "Timeout and position-unavailable errors",
        MetricType::Counter,
        site,
        summary.transient_errors_total,
    );
    write_metric(
        output,
        "geofence_source_fatal_errors_total",
        "Source errors that ended a session",
        MetricType::Counter,
        site,
        summary.fatal_errors_total,
    );
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_ingest_frames_total",
        "Frames received on the position listener",
        MetricType::Counter,
        site,
        summary.ingest_frames_total,
    );
    write_metric(
        output,
        "geofence_ingest_frames_rejected_total",
        "Frames that failed to parse or validate",
        MetricType::Counter,
        site,
        summary.ingest_frames_rejected,
    );
    write_metric(
        output,
        "geofence_ingest_frames_dropped_total",
        "Frames dropped on a full session feed",
        MetricType::Counter,
        site,
        summary.ingest_frames_dropped,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_sessions_started_total",
        "Monitoring sessions started",
        MetricType::Counter,
        site,
        summary.sessions_started_total,
    );
    write_metric(
        output,
        "geofence_active_sessions",
        "Monitoring sessions currently running",
        MetricType::Gauge,
        site,
        summary.active_sessions,
    );
    write_metric(
        output,
        "geofence_catalog_size",
        "Geofences in the catalog",
        MetricType::Gauge,
        site,
        summary.geofences,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => (StatusCode::OK, "text/plain", "ok".to_string()),
        _ => (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    Ok(response)
}

/// Start the Prometheus metrics HTTP server on `port`
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");
    serve_metrics(listener, metrics, site_id, shutdown).await
}

/// Accept loop on an already bound listener
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let site_id = Arc::new(site_id);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
