//! Position sources - cancellable streams of location fixes for one subject
//!
//! A source wraps whatever location facility is available (device feed,
//! TCP ingest, recorded replay). `subscribe` starts a pump task that applies
//! the sampling options and delivers fixes in order through a `Subscription`.
//! Cancelling (or dropping) the subscription stops the pump; nothing is
//! delivered after cancel.

use crate::domain::types::PositionSample;
use crate::infra::metrics::Metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Capacity of the channel between pump and session
const SUBSCRIPTION_BUFFER: usize = 64;

/// Location facility errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum SourceError {
    /// Location access refused; ends the session
    #[error("location permission denied")]
    PermissionDenied,
    #[error("timed out waiting for a position fix")]
    Timeout,
    #[error("position unavailable")]
    PositionUnavailable,
    /// The source was already subscribed once
    #[error("position source already subscribed")]
    AlreadySubscribed,
}

impl SourceError {
    /// Fatal errors stop the session; the rest are reported and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::PermissionDenied | SourceError::AlreadySubscribed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceError::PermissionDenied => "permission_denied",
            SourceError::Timeout => "timeout",
            SourceError::PositionUnavailable => "position_unavailable",
            SourceError::AlreadySubscribed => "already_subscribed",
        }
    }
}

/// A fix or an error from the underlying facility
pub type RawFix = Result<PositionSample, SourceError>;

/// Sampling options handed to the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Request the best available fix
    pub high_accuracy: bool,
    /// Report `Timeout` when no fix arrives within this window (0 disables)
    pub timeout_ms: u64,
    /// Ignore fixes whose `captured_at` is older than this
    ///
    /// Age is measured against the wall clock, so recorded captures fed
    /// through `--replay` lose every fix older than the limit. Leave it
    /// unset when replaying.
    pub max_sample_age_ms: Option<u64>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { high_accuracy: true, timeout_ms: 30_000, max_sample_age_ms: None }
    }
}

/// Continuous location feed for one subject
pub trait PositionSource: Send {
    /// Start delivering fixes; a source can be subscribed only once
    ///
    /// Must be called from within a tokio runtime.
    fn subscribe(&mut self, options: &SourceOptions) -> Result<Subscription, SourceError>;
}

/// Ordered stream of fixes with explicit cancellation
pub struct Subscription {
    rx: mpsc::Receiver<RawFix>,
    cancel_tx: watch::Sender<bool>,
}

impl Subscription {
    /// Next fix or error; `None` once the feed ends or after cancel
    pub async fn recv(&mut self) -> Option<RawFix> {
        if self.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop the pump; buffered fixes are discarded
    pub fn cancel(&mut self) {
        self.cancel_tx.send_replace(true);
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_tx.send_replace(true);
    }
}

enum Next {
    Fix(RawFix),
    TimedOut,
    Closed,
}

async fn next_fix(feed: &mut mpsc::Receiver<RawFix>, timeout: Option<Duration>) -> Next {
    match timeout {
        Some(window) => match tokio::time::timeout(window, feed.recv()).await {
            Ok(Some(fix)) => Next::Fix(fix),
            Ok(None) => Next::Closed,
            Err(_) => Next::TimedOut,
        },
        None => feed.recv().await.map_or(Next::Closed, Next::Fix),
    }
}

fn is_stale(sample: &PositionSample, max_age_ms: Option<u64>) -> bool {
    let Some(max_age_ms) = max_age_ms else {
        return false;
    };
    let age_ms = (Utc::now() - sample.captured_at).num_milliseconds();
    age_ms > i64::try_from(max_age_ms).unwrap_or(i64::MAX)
}

/// Spawn the pump that moves raw fixes from `feed` to a new subscription
///
/// Applies the timeout and maximum-age options. A fatal error is delivered
/// and then ends the stream.
pub fn spawn_pump(
    mut feed: mpsc::Receiver<RawFix>,
    options: &SourceOptions,
    metrics: Option<Arc<Metrics>>,
) -> Subscription {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let timeout = (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms));
    let max_age_ms = options.max_sample_age_ms;

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                next = next_fix(&mut feed, timeout) => next,
            };

            let item = match next {
                Next::Fix(Ok(sample)) => {
                    if is_stale(&sample, max_age_ms) {
                        debug!(
                            subject_id = %sample.subject_id,
                            captured_at = %sample.captured_at,
                            "position_fix_stale"
                        );
                        if let Some(ref m) = metrics {
                            m.record_stale_sample();
                        }
                        continue;
                    }
                    Ok(sample)
                }
                Next::Fix(Err(e)) => Err(e),
                Next::TimedOut => Err(SourceError::Timeout),
                Next::Closed => break,
            };

            let fatal = matches!(&item, Err(e) if e.is_fatal());
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            if fatal {
                break;
            }
        }
        debug!("position_pump_stopped");
    });

    Subscription { rx, cancel_tx }
}

/// Source fed through an mpsc channel (device adapter, ingest router, tests)
pub struct ChannelPositionSource {
    feed: Option<mpsc::Receiver<RawFix>>,
    metrics: Option<Arc<Metrics>>,
}

impl ChannelPositionSource {
    pub fn new(feed: mpsc::Receiver<RawFix>) -> Self {
        Self { feed: Some(feed), metrics: None }
    }

    /// Create a feed sender and the source reading from it
    pub fn channel(capacity: usize) -> (mpsc::Sender<RawFix>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl PositionSource for ChannelPositionSource {
    fn subscribe(&mut self, options: &SourceOptions) -> Result<Subscription, SourceError> {
        let feed = self.feed.take().ok_or(SourceError::AlreadySubscribed)?;
        info!(
            high_accuracy = %options.high_accuracy,
            timeout_ms = %options.timeout_ms,
            max_sample_age_ms = ?options.max_sample_age_ms,
            "position_subscribed"
        );
        Ok(spawn_pump(feed, options, self.metrics.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Coordinate, SubjectId};
    use chrono::Duration as ChronoDuration;

    fn fix(age_ms: i64) -> RawFix {
        Ok(PositionSample::new(
            SubjectId::from("emp-1"),
            Coordinate::new(0.0, 0.0).unwrap(),
            3.0,
            Utc::now() - ChronoDuration::milliseconds(age_ms),
        ))
    }

    fn no_timeout() -> SourceOptions {
        SourceOptions { timeout_ms: 0, ..Default::default() }
    }

    #[tokio::test]
    async fn test_delivers_in_order_then_ends() {
        let (tx, mut source) = ChannelPositionSource::channel(8);
        let mut sub = source.subscribe(&no_timeout()).unwrap();

        for age in [300, 200, 100] {
            tx.send(fix(age)).await.unwrap();
        }
        drop(tx);

        let mut ages = Vec::new();
        while let Some(item) = sub.recv().await {
            ages.push(item.unwrap().captured_at);
        }
        assert_eq!(ages.len(), 3);
        assert!(ages.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_second_subscribe_fails() {
        let (_tx, mut source) = ChannelPositionSource::channel(8);
        let _sub = source.subscribe(&no_timeout()).unwrap();
        assert!(matches!(source.subscribe(&no_timeout()), Err(SourceError::AlreadySubscribed)));
    }

    #[tokio::test]
    async fn test_transient_errors_pass_through() {
        let (tx, mut source) = ChannelPositionSource::channel(8);
        let mut sub = source.subscribe(&no_timeout()).unwrap();

        tx.send(Err(SourceError::PositionUnavailable)).await.unwrap();
        tx.send(fix(0)).await.unwrap();

        assert_eq!(sub.recv().await, Some(Err(SourceError::PositionUnavailable)));
        assert!(sub.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_permission_denied_ends_stream() {
        let (tx, mut source) = ChannelPositionSource::channel(8);
        let mut sub = source.subscribe(&no_timeout()).unwrap();

        tx.send(Err(SourceError::PermissionDenied)).await.unwrap();
        // Anything after the fatal error is never delivered
        let _ = tx.send(fix(0)).await;

        assert_eq!(sub.recv().await, Some(Err(SourceError::PermissionDenied)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_and_keeps_waiting() {
        let (tx, mut source) = ChannelPositionSource::channel(8);
        let options = SourceOptions { timeout_ms: 1_000, ..Default::default() };
        let mut sub = source.subscribe(&options).unwrap();

        assert_eq!(sub.recv().await, Some(Err(SourceError::Timeout)));

        tx.send(fix(0)).await.unwrap();
        assert!(sub.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stale_fixes_are_dropped() {
        let metrics = Arc::new(Metrics::new());
        let (tx, source) = ChannelPositionSource::channel(8);
        let mut source = source.with_metrics(metrics.clone());
        let options = SourceOptions { max_sample_age_ms: Some(60_000), ..no_timeout() };
        let mut sub = source.subscribe(&options).unwrap();

        tx.send(fix(120_000)).await.unwrap();
        tx.send(fix(0)).await.unwrap();
        drop(tx);

        assert!(sub.recv().await.unwrap().is_ok());
        assert_eq!(sub.recv().await, None);
        assert_eq!(metrics.stale_samples_total(), 1);
    }

    #[tokio::test]
    async fn test_huge_max_age_keeps_fresh_fixes() {
        let metrics = Arc::new(Metrics::new());
        let (tx, source) = ChannelPositionSource::channel(8);
        let mut source = source.with_metrics(metrics.clone());
        let options = SourceOptions { max_sample_age_ms: Some(u64::MAX), ..no_timeout() };
        let mut sub = source.subscribe(&options).unwrap();

        tx.send(fix(0)).await.unwrap();
        tx.send(fix(86_400_000)).await.unwrap();
        drop(tx);

        assert!(sub.recv().await.unwrap().is_ok());
        assert!(sub.recv().await.unwrap().is_ok());
        assert_eq!(sub.recv().await, None);
        assert_eq!(metrics.stale_samples_total(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let (tx, mut source) = ChannelPositionSource::channel(8);
        let mut sub = source.subscribe(&no_timeout()).unwrap();

        tx.send(fix(0)).await.unwrap();
        assert!(sub.recv().await.is_some());

        tx.send(fix(0)).await.unwrap();
        sub.cancel();
        assert!(sub.is_cancelled());
        assert_eq!(sub.recv().await, None);

        // Pump exits and drops the feed receiver
        tokio::time::timeout(Duration::from_secs(1), tx.closed()).await.unwrap();
    }
}
