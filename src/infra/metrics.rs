//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap). Scrapes read a separate
//! set of lifetime latency counters through `snapshot()` and never reset
//! the reporting window.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::EventKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total samples evaluated (monotonic)
    samples_total: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Sum of evaluation latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max evaluation latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Sample evaluation latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of evaluation latencies since start (monotonic)
    latency_sum_total_us: AtomicU64,
    /// Max evaluation latency since start (monotonic)
    latency_max_total_us: AtomicU64,
    /// Latency histogram since start (monotonic, scraped by Prometheus)
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Fixes dropped for exceeding the maximum sample age (monotonic)
    stale_samples_total: AtomicU64,
    /// Timeout / position-unavailable errors (monotonic)
    transient_errors_total: AtomicU64,
    /// Permission-denied errors that ended a session (monotonic)
    fatal_errors_total: AtomicU64,
    /// Entry events emitted (monotonic)
    entries_total: AtomicU64,
    /// Exit events emitted (monotonic)
    exits_total: AtomicU64,
    /// Events the sink failed to record (monotonic)
    sink_failures_total: AtomicU64,
    /// Session notices dropped because the caller's queue was full (monotonic)
    notices_dropped_total: AtomicU64,
    /// Ingest frames received on the position listener (monotonic)
    ingest_frames_total: AtomicU64,
    /// Ingest frames that failed to parse or validate (monotonic)
    ingest_frames_rejected: AtomicU64,
    /// Ingest frames dropped due to a full session feed (monotonic)
    ingest_frames_dropped: AtomicU64,
    /// Sessions started (monotonic)
    sessions_started_total: AtomicU64,
    /// Currently running sessions (gauge)
    active_sessions: AtomicU64,
    /// Geofences in the catalog (gauge)
    geofences: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
    started_at: Instant,
}

/// Latency figures for one summary, either the report window or lifetime
struct LatencyWindow {
    samples: u64,
    sum_us: u64,
    max_us: u64,
    buckets: [u64; NUM_BUCKETS],
    elapsed_secs: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_total_us: AtomicU64::new(0),
            latency_max_total_us: AtomicU64::new(0),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            stale_samples_total: AtomicU64::new(0),
            transient_errors_total: AtomicU64::new(0),
            fatal_errors_total: AtomicU64::new(0),
            entries_total: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            sink_failures_total: AtomicU64::new(0),
            notices_dropped_total: AtomicU64::new(0),
            ingest_frames_total: AtomicU64::new(0),
            ingest_frames_rejected: AtomicU64::new(0),
            ingest_frames_dropped: AtomicU64::new(0),
            sessions_started_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            geofences: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
            started_at: Instant::now(),
        }
    }

    /// Record a sample was evaluated with given latency (lock-free)
    #[inline]
    pub fn record_sample_processed(&self, latency_us: u64) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
        update_atomic_max(&self.latency_max_total_us, latency_us);
    }

    #[inline]
    pub fn record_stale_sample(&self) {
        self.stale_samples_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transient_error(&self) {
        self.transient_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fatal_error(&self) {
        self.fatal_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event(&self, kind: EventKind) {
        match kind {
            EventKind::Entry => self.entries_total.fetch_add(1, Ordering::Relaxed),
            EventKind::Exit => self.exits_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_sink_failure(&self) {
        self.sink_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notice_dropped(&self) {
        self.notices_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ingest_frame(&self) {
        self.ingest_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ingest_rejected(&self) {
        self.ingest_frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ingest_dropped(&self) {
        self.ingest_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_ended(&self) {
        // Saturating: never wrap below zero
        let _ = self.active_sessions.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    #[inline]
    pub fn set_geofences(&self, count: usize) {
        self.geofences.store(count as u64, Ordering::Relaxed);
    }

    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    pub fn entries_total(&self) -> u64 {
        self.entries_total.load(Ordering::Relaxed)
    }

    pub fn exits_total(&self) -> u64 {
        self.exits_total.load(Ordering::Relaxed)
    }

    pub fn sink_failures_total(&self) -> u64 {
        self.sink_failures_total.load(Ordering::Relaxed)
    }

    pub fn stale_samples_total(&self) -> u64 {
        self.stale_samples_total.load(Ordering::Relaxed)
    }

    pub fn transient_errors_total(&self) -> u64 {
        self.transient_errors_total.load(Ordering::Relaxed)
    }

    pub fn fatal_errors_total(&self) -> u64 {
        self.fatal_errors_total.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn ingest_frames_rejected(&self) -> u64 {
        self.ingest_frames_rejected.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let samples_count = self.samples_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(LatencyWindow {
            samples: samples_count,
            sum_us: latency_sum,
            max_us: max_latency,
            buckets: lat_buckets,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    /// Lifetime view for scrapes; leaves the reporting window untouched
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(LatencyWindow {
            samples: self.samples_total.load(Ordering::Relaxed),
            sum_us: self.latency_sum_total_us.load(Ordering::Relaxed),
            max_us: self.latency_max_total_us.load(Ordering::Relaxed),
            buckets: load_buckets(&self.latency_buckets_total),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        })
    }

    fn summarize(&self, window: LatencyWindow) -> MetricsSummary {
        let samples_per_sec = if window.elapsed_secs > 0.0 {
            window.samples as f64 / window.elapsed_secs
        } else {
            0.0
        };
        let avg_latency = if window.samples > 0 { window.sum_us / window.samples } else { 0 };

        MetricsSummary {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            samples_per_sec,
            avg_eval_latency_us: avg_latency,
            max_eval_latency_us: window.max_us,
            lat_buckets: window.buckets,
            lat_p50_us: percentile_from_buckets(&window.buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&window.buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&window.buckets, 0.99),
            stale_samples_total: self.stale_samples_total.load(Ordering::Relaxed),
            transient_errors_total: self.transient_errors_total.load(Ordering::Relaxed),
            fatal_errors_total: self.fatal_errors_total.load(Ordering::Relaxed),
            entries_total: self.entries_total.load(Ordering::Relaxed),
            exits_total: self.exits_total.load(Ordering::Relaxed),
            sink_failures_total: self.sink_failures_total.load(Ordering::Relaxed),
            notices_dropped_total: self.notices_dropped_total.load(Ordering::Relaxed),
            ingest_frames_total: self.ingest_frames_total.load(Ordering::Relaxed),
            ingest_frames_rejected: self.ingest_frames_rejected.load(Ordering::Relaxed),
            ingest_frames_dropped: self.ingest_frames_dropped.load(Ordering::Relaxed),
            sessions_started_total: self.sessions_started_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            geofences: self.geofences.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_per_sec: f64,
    pub avg_eval_latency_us: u64,
    pub max_eval_latency_us: u64,
    /// Sample evaluation latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub stale_samples_total: u64,
    pub transient_errors_total: u64,
    pub fatal_errors_total: u64,
    pub entries_total: u64,
    pub exits_total: u64,
    pub sink_failures_total: u64,
    pub notices_dropped_total: u64,
    pub ingest_frames_total: u64,
    pub ingest_frames_rejected: u64,
    pub ingest_frames_dropped: u64,
    pub sessions_started_total: u64,
    pub active_sessions: u64,
    pub geofences: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_per_sec = format!("{:.1}", self.samples_per_sec),
            avg_latency_us = %self.avg_eval_latency_us,
            max_latency_us = %self.max_eval_latency_us,
            p99_us = %self.lat_p99_us,
            entries = %self.entries_total,
            exits = %self.exits_total,
            sink_failures = %self.sink_failures_total,
            transient_errors = %self.transient_errors_total,
            active_sessions = %self.active_sessions,
            geofences = %self.geofences,
            "metrics"
        );
    }
}
