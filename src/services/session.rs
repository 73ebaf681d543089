//! Monitoring sessions - one tokio task per subject
//!
//! A session wires a subject's position subscription through the evaluator
//! and transition tracker and forwards the resulting events to the sink.
//! Samples are processed strictly in arrival order: the next sample is not
//! read until the previous one's events have been handed to the sink.
//!
//! Stop is signalled over a `watch` channel that is checked with priority
//! before and after every receive, so no sample is evaluated once stop has
//! been requested.

use crate::domain::types::{new_uuid_v7, AttendanceEvent, EventKind, PositionSample, SubjectId};
use crate::infra::metrics::Metrics;
use crate::io::position_source::{PositionSource, SourceError, SourceOptions, Subscription};
use crate::io::sink::{AttendanceSink, SinkError};
use crate::services::catalog::GeofenceCatalog;
use crate::services::evaluator::MembershipEvaluator;
use crate::services::transition::TransitionTracker;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-session tracking settings
#[derive(Debug, Clone)]
pub struct TrackingSettings {
    /// Hysteresis window for OUTSIDE<->INSIDE changes (0 = disabled)
    pub min_dwell_ms: u64,
    /// Capacity of each session's notice channel
    pub notice_capacity: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self { min_dwell_ms: 0, notice_capacity: 64 }
    }
}

/// Non-event conditions reported to whoever holds the session handle
#[derive(Debug)]
pub enum SessionNotice {
    /// Timeout or unavailable fix; the session keeps running
    TransientSourceError(SourceError),
    /// The sink refused an event; tracker state is not rolled back
    SinkFailed { event: AttendanceEvent, error: SinkError },
    /// The source failed for good; the session has ended
    Fatal(SourceError),
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// `stop_monitoring` was called (or the handle was dropped)
    Stopped,
    /// The position feed ran out
    SourceEnded,
    /// Fatal source error, e.g. permission denied
    Failed(SourceError),
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("subject {0} is already being monitored")]
    AlreadyMonitoring(SubjectId),
    #[error("failed to subscribe to position source: {0}")]
    Source(#[from] SourceError),
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

/// Handle to a running session
pub struct SessionHandle {
    session_id: String,
    subject_id: SubjectId,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<SessionExit>,
    notices: Option<mpsc::Receiver<SessionNotice>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Take the notice stream (only once)
    pub fn take_notices(&mut self) -> Option<mpsc::Receiver<SessionNotice>> {
        self.notices.take()
    }

    /// Whether the session task has already ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end on its own (source ended or failed)
    pub async fn wait(self) -> Result<SessionExit, MonitorError> {
        // Keep the sender alive while waiting so the session isn't stopped
        let SessionHandle { task, shutdown_tx, .. } = self;
        let exit = task.await.map_err(|e| MonitorError::TaskFailed(e.to_string()));
        drop(shutdown_tx);
        exit
    }
}

/// Removes the subject from the active set when the session task ends
struct ActiveGuard {
    active: Arc<Mutex<FxHashSet<SubjectId>>>,
    subject_id: SubjectId,
    metrics: Arc<Metrics>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.subject_id);
        self.metrics.session_ended();
    }
}

/// Starts and stops monitoring sessions against a shared catalog and sink
pub struct Monitor {
    catalog: Arc<GeofenceCatalog>,
    sink: Arc<dyn AttendanceSink>,
    metrics: Arc<Metrics>,
    settings: TrackingSettings,
    active: Arc<Mutex<FxHashSet<SubjectId>>>,
}

impl Monitor {
    pub fn new(
        catalog: Arc<GeofenceCatalog>,
        sink: Arc<dyn AttendanceSink>,
        metrics: Arc<Metrics>,
        settings: TrackingSettings,
    ) -> Self {
        Self { catalog, sink, metrics, settings, active: Arc::new(Mutex::new(FxHashSet::default())) }
    }

    pub fn catalog(&self) -> &Arc<GeofenceCatalog> {
        &self.catalog
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Whether a session is currently running for `subject_id`
    pub fn is_monitoring(&self, subject_id: &SubjectId) -> bool {
        self.active.lock().contains(subject_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.active.lock().len()
    }

    /// Subscribe to `source` and start a session task for `subject_id`
    ///
    /// Must be called from within a tokio runtime. Fails if the subject
    /// already has a running session or the source refuses the subscription.
    pub fn start_monitoring<S: PositionSource>(
        &self,
        subject_id: SubjectId,
        mut source: S,
        options: &SourceOptions,
    ) -> Result<SessionHandle, MonitorError> {
        if !self.active.lock().insert(subject_id.clone()) {
            warn!(subject_id = %subject_id, "monitoring_already_active");
            return Err(MonitorError::AlreadyMonitoring(subject_id));
        }
        self.metrics.session_started();
        let guard = ActiveGuard {
            active: self.active.clone(),
            subject_id: subject_id.clone(),
            metrics: self.metrics.clone(),
        };

        // Guard drop releases the subject if subscribe fails
        let subscription = source.subscribe(options)?;

        let session_id = new_uuid_v7();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (notice_tx, notice_rx) = mpsc::channel(self.settings.notice_capacity.max(1));

        let session = MonitoringSession {
            session_id: session_id.clone(),
            tracker: TransitionTracker::new(subject_id.clone())
                .with_min_dwell_ms(self.settings.min_dwell_ms),
            subject_id: subject_id.clone(),
            evaluator: MembershipEvaluator::new(),
            catalog: self.catalog.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
            notices: notice_tx,
        };

        info!(
            subject_id = %subject_id,
            session_id = %session_id,
            min_dwell_ms = %self.settings.min_dwell_ms,
            "monitoring_started"
        );

        let task = tokio::spawn(async move {
            let _guard = guard;
            session.run(subscription, shutdown_rx).await
        });

        Ok(SessionHandle { session_id, subject_id, shutdown_tx, task, notices: Some(notice_rx) })
    }

    /// Stop a session and wait for its task to finish
    ///
    /// A sample already being processed completes; nothing after it is
    /// evaluated. Tracker state is discarded with the task.
    pub async fn stop_monitoring(&self, handle: SessionHandle) -> Result<SessionExit, MonitorError> {
        let SessionHandle { session_id, subject_id, shutdown_tx, task, .. } = handle;
        shutdown_tx.send_replace(true);
        let exit = task.await.map_err(|e| {
            error!(subject_id = %subject_id, session_id = %session_id, error = %e, "session_task_failed");
            MonitorError::TaskFailed(e.to_string())
        })?;
        info!(subject_id = %subject_id, session_id = %session_id, exit = ?exit, "monitoring_stopped");
        Ok(exit)
    }
}

/// Pipeline state owned by one session task
struct MonitoringSession {
    session_id: String,
    subject_id: SubjectId,
    tracker: TransitionTracker,
    evaluator: MembershipEvaluator,
    catalog: Arc<GeofenceCatalog>,
    sink: Arc<dyn AttendanceSink>,
    metrics: Arc<Metrics>,
    notices: mpsc::Sender<SessionNotice>,
}

impl MonitoringSession {
    async fn run(mut self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) -> SessionExit {
        let exit = loop {
            if *shutdown.borrow() {
                break SessionExit::Stopped;
            }

            let item = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // Sender gone means the handle was dropped
                    if changed.is_err() {
                        break SessionExit::Stopped;
                    }
                    continue;
                }
                item = subscription.recv() => item,
            };

            // Stop may have been requested while the fix was in flight
            if *shutdown.borrow() {
                break SessionExit::Stopped;
            }

            match item {
                Some(Ok(sample)) => self.process_sample(sample).await,
                Some(Err(e)) if e.is_fatal() => {
                    self.metrics.record_fatal_error();
                    error!(
                        subject_id = %self.subject_id,
                        session_id = %self.session_id,
                        error = %e,
                        "position_source_fatal"
                    );
                    self.notify(SessionNotice::Fatal(e));
                    break SessionExit::Failed(e);
                }
                Some(Err(e)) => {
                    self.metrics.record_transient_error();
                    warn!(
                        subject_id = %self.subject_id,
                        session_id = %self.session_id,
                        error = %e,
                        "position_source_transient_error"
                    );
                    self.notify(SessionNotice::TransientSourceError(e));
                }
                None => break SessionExit::SourceEnded,
            }
        };

        subscription.cancel();
        info!(
            subject_id = %self.subject_id,
            session_id = %self.session_id,
            exit = ?exit,
            tracked = %self.tracker.tracked(),
            "session_ended"
        );
        exit
    }

    async fn process_sample(&mut self, sample: PositionSample) {
        if sample.subject_id != self.subject_id {
            warn!(
                subject_id = %self.subject_id,
                sample_subject_id = %sample.subject_id,
                "sample_subject_mismatch"
            );
            return;
        }

        let start = Instant::now();
        let snapshot = self.catalog.snapshot();
        let verdicts = self.evaluator.evaluate(&sample, &snapshot);
        let events = self.tracker.apply(&sample, &verdicts);
        self.metrics.record_sample_processed(start.elapsed().as_micros() as u64);

        debug!(
            subject_id = %self.subject_id,
            catalog_version = %snapshot.version,
            geofences = %verdicts.len(),
            inside = %verdicts.iter().filter(|v| v.inside).count(),
            accuracy_m = %sample.accuracy_m,
            events = %events.len(),
            "sample_evaluated"
        );

        for event in events {
            self.metrics.record_event(event.kind);
            match event.kind {
                EventKind::Entry => info!(
                    subject_id = %event.subject_id,
                    geofence_id = %event.geofence_id,
                    event_id = %event.event_id,
                    at = %event.at,
                    "attendance_entry"
                ),
                EventKind::Exit => info!(
                    subject_id = %event.subject_id,
                    geofence_id = %event.geofence_id,
                    event_id = %event.event_id,
                    trigger = ?event.trigger,
                    at = %event.at,
                    "attendance_exit"
                ),
            }

            if let Err(e) = self.sink.record(&event).await {
                self.metrics.record_sink_failure();
                warn!(
                    subject_id = %event.subject_id,
                    geofence_id = %event.geofence_id,
                    event_id = %event.event_id,
                    error = %e,
                    "sink_record_failed"
                );
                self.notify(SessionNotice::SinkFailed { event, error: e });
            }
        }
    }

    /// Never blocks the pipeline; a full or abandoned notice channel drops
    fn notify(&self, notice: SessionNotice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_notice_dropped();
                debug!(subject_id = %self.subject_id, "session_notice_dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Coordinate, Geofence, GeofenceId, Trigger};
    use crate::io::position_source::{ChannelPositionSource, RawFix};
    use crate::io::sink::ChannelSink;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    const INSIDE: (f64, f64) = (0.0, 0.0);
    const OUTSIDE: (f64, f64) = (0.0, 0.002);

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    fn fix(subject: &str, at: (f64, f64), n: i64) -> RawFix {
        Ok(PositionSample::new(
            SubjectId::from(subject),
            Coordinate::new(at.0, at.1).unwrap(),
            5.0,
            base_time() + ChronoDuration::seconds(10 * n),
        ))
    }

    fn options() -> SourceOptions {
        SourceOptions { timeout_ms: 0, ..Default::default() }
    }

    fn catalog() -> Arc<GeofenceCatalog> {
        let catalog = Arc::new(GeofenceCatalog::new());
        catalog.upsert(Geofence::new("hq", Coordinate::new(0.0, 0.0).unwrap(), 100.0)).unwrap();
        catalog
    }

    struct Setup {
        monitor: Monitor,
        events: mpsc::Receiver<AttendanceEvent>,
        metrics: Arc<Metrics>,
    }

    fn setup(settings: TrackingSettings) -> Setup {
        let metrics = Arc::new(Metrics::new());
        let (sink, events) = ChannelSink::channel(64);
        let monitor = Monitor::new(catalog(), Arc::new(sink), metrics.clone(), settings);
        Setup { monitor, events, metrics }
    }

    struct FailingSink;

    #[async_trait]
    impl AttendanceSink for FailingSink {
        async fn record(&self, _event: &AttendanceEvent) -> Result<(), SinkError> {
            Err(SinkError::Rejected(500))
        }
    }

    #[tokio::test]
    async fn test_entry_then_exit_forwarded_in_order() {
        let mut s = setup(TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(16);
        let handle = s.monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();

        for (n, at) in [OUTSIDE, OUTSIDE, INSIDE, INSIDE, OUTSIDE].into_iter().enumerate() {
            tx.send(fix("emp-1", at, n as i64)).await.unwrap();
        }
        drop(tx);

        assert_eq!(handle.wait().await.unwrap(), SessionExit::SourceEnded);

        let entry = s.events.recv().await.unwrap();
        assert_eq!(entry.kind, EventKind::Entry);
        assert_eq!(entry.geofence_id, GeofenceId::from("hq"));
        assert_eq!(entry.at, base_time() + ChronoDuration::seconds(20));

        let exit = s.events.recv().await.unwrap();
        assert_eq!(exit.kind, EventKind::Exit);
        assert_eq!(exit.trigger, Trigger::Sample);
        assert!(s.events.try_recv().is_err());

        assert_eq!(s.metrics.samples_total(), 5);
        assert_eq!(s.metrics.entries_total(), 1);
        assert_eq!(s.metrics.exits_total(), 1);
    }

    #[tokio::test]
    async fn test_second_session_for_subject_rejected() {
        let s = setup(TrackingSettings::default());
        let (_tx1, source1) = ChannelPositionSource::channel(4);
        let (_tx2, source2) = ChannelPositionSource::channel(4);
        let subject = SubjectId::from("emp-1");

        let handle = s.monitor.start_monitoring(subject.clone(), source1, &options()).unwrap();
        assert!(s.monitor.is_monitoring(&subject));
        assert!(matches!(
            s.monitor.start_monitoring(subject.clone(), source2, &options()),
            Err(MonitorError::AlreadyMonitoring(_))
        ));

        assert_eq!(s.monitor.stop_monitoring(handle).await.unwrap(), SessionExit::Stopped);
        assert!(!s.monitor.is_monitoring(&subject));
        assert_eq!(s.metrics.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_consumed_source_releases_subject() {
        let s = setup(TrackingSettings::default());
        let (_tx, mut source) = ChannelPositionSource::channel(4);
        let _sub = source.subscribe(&options()).unwrap();

        let subject = SubjectId::from("emp-1");
        assert!(matches!(
            s.monitor.start_monitoring(subject.clone(), source, &options()),
            Err(MonitorError::Source(SourceError::AlreadySubscribed))
        ));
        assert!(!s.monitor.is_monitoring(&subject));
    }

    #[tokio::test]
    async fn test_permission_denied_fails_session() {
        let s = setup(TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(4);
        let mut handle = s.monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();
        let mut notices = handle.take_notices().unwrap();

        tx.send(Err(SourceError::PermissionDenied)).await.unwrap();

        assert_eq!(handle.wait().await.unwrap(), SessionExit::Failed(SourceError::PermissionDenied));
        assert!(matches!(notices.recv().await, Some(SessionNotice::Fatal(SourceError::PermissionDenied))));
        assert_eq!(s.metrics.fatal_errors_total(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_keep_session_alive() {
        let mut s = setup(TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(8);
        let mut handle = s.monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();
        let mut notices = handle.take_notices().unwrap();

        tx.send(fix("emp-1", OUTSIDE, 0)).await.unwrap();
        tx.send(Err(SourceError::Timeout)).await.unwrap();
        tx.send(Err(SourceError::PositionUnavailable)).await.unwrap();
        tx.send(fix("emp-1", INSIDE, 1)).await.unwrap();
        drop(tx);

        assert_eq!(handle.wait().await.unwrap(), SessionExit::SourceEnded);
        assert_eq!(s.events.recv().await.unwrap().kind, EventKind::Entry);
        assert!(matches!(notices.recv().await, Some(SessionNotice::TransientSourceError(SourceError::Timeout))));
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::TransientSourceError(SourceError::PositionUnavailable))
        ));
        assert_eq!(s.metrics.transient_errors_total(), 2);
    }

    #[tokio::test]
    async fn test_sink_failure_reported_without_retry() {
        let metrics = Arc::new(Metrics::new());
        let monitor = Monitor::new(catalog(), Arc::new(FailingSink), metrics.clone(), TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(8);
        let mut handle = monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();
        let mut notices = handle.take_notices().unwrap();

        tx.send(fix("emp-1", OUTSIDE, 0)).await.unwrap();
        tx.send(fix("emp-1", INSIDE, 1)).await.unwrap();
        tx.send(fix("emp-1", INSIDE, 2)).await.unwrap();
        drop(tx);
        handle.wait().await.unwrap();

        match notices.recv().await {
            Some(SessionNotice::SinkFailed { event, error }) => {
                assert_eq!(event.kind, EventKind::Entry);
                assert!(matches!(error, SinkError::Rejected(500)));
            }
            other => panic!("expected sink failure notice, got {other:?}"),
        }
        // State advanced anyway: the later INSIDE sample emits nothing
        assert!(notices.try_recv().is_err());
        assert_eq!(metrics.sink_failures_total(), 1);
        assert_eq!(metrics.entries_total(), 1);
    }

    #[tokio::test]
    async fn test_stop_discards_tracker_state() {
        let mut s = setup(TrackingSettings::default());
        let subject = SubjectId::from("emp-1");

        let (tx, source) = ChannelPositionSource::channel(8);
        let handle = s.monitor.start_monitoring(subject.clone(), source, &options()).unwrap();
        tx.send(fix("emp-1", OUTSIDE, 0)).await.unwrap();
        // Let the session consume the sample before stopping
        while s.metrics.samples_total() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.monitor.stop_monitoring(handle).await.unwrap();

        // Fresh session starts at UNKNOWN: first INSIDE sample emits nothing
        let (tx, source) = ChannelPositionSource::channel(8);
        let handle = s.monitor.start_monitoring(subject, source, &options()).unwrap();
        tx.send(fix("emp-1", INSIDE, 1)).await.unwrap();
        drop(tx);
        assert_eq!(handle.wait().await.unwrap(), SessionExit::SourceEnded);
        assert!(s.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_nothing_evaluated_after_stop() {
        let mut s = setup(TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(8);
        let handle = s.monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();

        tx.send(fix("emp-1", OUTSIDE, 0)).await.unwrap();
        while s.metrics.samples_total() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(s.monitor.stop_monitoring(handle).await.unwrap(), SessionExit::Stopped);

        // Subscription is cancelled: the feed is closed for the producer
        tokio::time::timeout(Duration::from_secs(1), tx.closed()).await.unwrap();
        assert!(tx.send(fix("emp-1", INSIDE, 1)).await.is_err());
        assert_eq!(s.metrics.samples_total(), 1);
        assert!(s.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_foreign_subject_samples_ignored() {
        let mut s = setup(TrackingSettings::default());
        let (tx, source) = ChannelPositionSource::channel(8);
        let handle = s.monitor.start_monitoring(SubjectId::from("emp-1"), source, &options()).unwrap();

        tx.send(fix("emp-1", OUTSIDE, 0)).await.unwrap();
        tx.send(fix("emp-2", INSIDE, 1)).await.unwrap();
        drop(tx);

        handle.wait().await.unwrap();
        assert!(s.events.try_recv().is_err());
        assert_eq!(s.metrics.samples_total(), 1);
    }
}
