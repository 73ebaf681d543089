//! TCP position ingest listener
//!
//! Listens on port 7070 for newline-delimited JSON frames from device
//! gateways:
//!   {"type":"fix","subject_id":"emp-1","latitude":..,"longitude":..,"accuracy_m":..,"captured_at":"RFC3339"}
//!   {"type":"error","subject_id":"emp-1","code":"timeout"}
//!
//! Each subject gets a monitoring session on its first frame. Frames are
//! routed with try_send so a slow session never blocks a connection; drops
//! are counted in metrics. A `permission_denied` frame ends the subject's
//! session and the next frame starts a fresh one.

use crate::domain::types::{Coordinate, GeoError, PositionSample, SubjectId};
use crate::infra::metrics::Metrics;
use crate::io::position_source::{ChannelPositionSource, RawFix, SourceError, SourceOptions};
use crate::services::session::{Monitor, MonitorError, SessionExit, SessionHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Position listener configuration
#[derive(Debug, Clone)]
pub struct PositionListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for PositionListenerConfig {
    fn default() -> Self {
        Self { port: 7070, enabled: true }
    }
}

/// One line of the ingest protocol (also the replay capture format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestFrame {
    Fix {
        subject_id: SubjectId,
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy_m: f64,
        /// Defaults to receive time when the gateway omits it
        #[serde(default = "Utc::now")]
        captured_at: DateTime<Utc>,
    },
    Error {
        subject_id: SubjectId,
        code: SourceError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Coordinate(#[from] GeoError),
    #[error("accuracy must be >= 0, got {0}")]
    NegativeAccuracy(f64),
}

impl IngestFrame {
    pub fn subject_id(&self) -> &SubjectId {
        match self {
            IngestFrame::Fix { subject_id, .. } | IngestFrame::Error { subject_id, .. } => subject_id,
        }
    }

    /// Validate and convert into the raw fix a position source delivers
    pub fn into_raw_fix(self) -> Result<(SubjectId, RawFix), FrameError> {
        match self {
            IngestFrame::Fix { subject_id, latitude, longitude, accuracy_m, captured_at } => {
                if accuracy_m.is_nan() || accuracy_m < 0.0 {
                    return Err(FrameError::NegativeAccuracy(accuracy_m));
                }
                let coordinate = Coordinate::new(latitude, longitude)?;
                let sample = PositionSample::new(subject_id.clone(), coordinate, accuracy_m, captured_at);
                Ok((subject_id, Ok(sample)))
            }
            IngestFrame::Error { subject_id, code } => Ok((subject_id, Err(code))),
        }
    }
}

/// Parse one protocol line
pub fn parse_frame(line: &str) -> Result<(SubjectId, RawFix), FrameError> {
    serde_json::from_str::<IngestFrame>(line)?.into_raw_fix()
}

/// What happened to a routed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Subject's feed was full
    Dropped,
    /// No session could be started for the subject
    Refused,
}

struct Route {
    feed: mpsc::Sender<RawFix>,
    handle: SessionHandle,
}

/// Maps subjects to their running sessions, starting sessions on demand
pub struct SubjectRouter {
    monitor: Arc<Monitor>,
    options: SourceOptions,
    feed_capacity: usize,
    routes: Mutex<FxHashMap<SubjectId, Route>>,
    /// Sessions handed a fatal error that have not finished yet
    retiring: Mutex<FxHashMap<SubjectId, SessionHandle>>,
}

impl SubjectRouter {
    pub fn new(monitor: Arc<Monitor>, options: SourceOptions, feed_capacity: usize) -> Self {
        Self {
            monitor,
            options,
            feed_capacity: feed_capacity.max(1),
            routes: Mutex::new(FxHashMap::default()),
            retiring: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of subjects with a live route
    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a fix to the subject's session, starting one if needed
    ///
    /// A delivered fatal error retires the route at once. The next frame for
    /// that subject waits for the retired session to end, then starts a new one.
    pub async fn route(&self, subject_id: SubjectId, fix: RawFix) -> RouteOutcome {
        let retired = self.retiring.lock().remove(&subject_id);
        if let Some(handle) = retired {
            let session_id = handle.session_id().to_string();
            match handle.wait().await {
                Ok(exit) => {
                    debug!(subject_id = %subject_id, session_id = %session_id, exit = ?exit, "ingest_session_retired")
                }
                Err(e) => {
                    warn!(subject_id = %subject_id, session_id = %session_id, error = %e, "ingest_session_retire_failed")
                }
            }
        }
        self.route_now(subject_id, fix)
    }

    fn route_now(&self, subject_id: SubjectId, fix: RawFix) -> RouteOutcome {
        let fatal = matches!(&fix, Err(e) if e.is_fatal());
        let mut routes = self.routes.lock();

        let pending = match routes.get(&subject_id) {
            Some(route) if !route.handle.is_finished() => match route.feed.try_send(fix) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => return RouteOutcome::Dropped,
                // Session ended between the check and the send
                Err(TrySendError::Closed(fix)) => Some(fix),
            },
            _ => Some(fix),
        };
        let Some(fix) = pending else {
            if fatal {
                if let Some(route) = routes.remove(&subject_id) {
                    self.retire(subject_id, route.handle);
                }
            }
            return RouteOutcome::Delivered;
        };

        if let Some(stale) = routes.remove(&subject_id) {
            debug!(subject_id = %subject_id, session_id = %stale.handle.session_id(), "ingest_route_expired");
        }

        let (feed, source) = ChannelPositionSource::channel(self.feed_capacity);
        let source = source.with_metrics(self.monitor.metrics().clone());
        let mut handle = match self.monitor.start_monitoring(subject_id.clone(), source, &self.options) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(subject_id = %subject_id, error = %e, "ingest_session_start_failed");
                return RouteOutcome::Refused;
            }
        };
        // Sessions log their own notices
        drop(handle.take_notices());

        // Fresh channel with capacity >= 1 cannot be full
        let outcome = match feed.try_send(fix) {
            Ok(()) => RouteOutcome::Delivered,
            Err(_) => RouteOutcome::Dropped,
        };
        info!(subject_id = %subject_id, session_id = %handle.session_id(), "ingest_session_started");
        if fatal && outcome == RouteOutcome::Delivered {
            self.retire(subject_id, handle);
        } else {
            routes.insert(subject_id, Route { feed, handle });
        }
        outcome
    }

    fn retire(&self, subject_id: SubjectId, handle: SessionHandle) {
        debug!(subject_id = %subject_id, session_id = %handle.session_id(), "ingest_route_retired");
        self.retiring.lock().insert(subject_id, handle);
    }

    /// Stop every routed session and wait for them to finish
    pub async fn shutdown_all(&self) -> Vec<(SubjectId, Result<SessionExit, MonitorError>)> {
        let mut handles: Vec<SessionHandle> = self.routes.lock().drain().map(|(_, route)| route.handle).collect();
        handles.extend(self.retiring.lock().drain().map(|(_, handle)| handle));
        let mut exits = Vec::with_capacity(handles.len());
        for handle in handles {
            let subject_id = handle.subject().clone();
            exits.push((subject_id, self.monitor.stop_monitoring(handle).await));
        }
        info!(sessions = %exits.len(), "ingest_sessions_stopped");
        exits
    }
}

/// Start the position listener on the configured port
pub async fn start_position_listener(
    config: PositionListenerConfig,
    router: Arc<SubjectRouter>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("position_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(port = %config.port, "position_listener_started");

    serve_position_listener(listener, router, metrics, shutdown).await
}

/// Accept loop on an already bound listener
pub async fn serve_position_listener(
    listener: TcpListener,
    router: Arc<SubjectRouter>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("position_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let r = router.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, addr, r, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "position_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    router: Arc<SubjectRouter>,
    metrics: Arc<Metrics>,
) {
    let peer = addr.to_string();
    debug!(peer = %peer, "position_connection_accepted");

    let reader = BufReader::new(socket);
    let mut lines = reader.lines();

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        metrics.record_ingest_frame();
        let (subject_id, fix) = match parse_frame(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                metrics.record_ingest_rejected();
                warn!(peer = %peer, error = %e, "position_frame_rejected");
                continue;
            }
        };

        match router.route(subject_id.clone(), fix).await {
            RouteOutcome::Delivered => {}
            RouteOutcome::Dropped => {
                metrics.record_ingest_dropped();
                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer = %peer, subject_id = %subject_id, "position_frame_dropped: feed full");
                    last_drop_warn = Instant::now();
                }
            }
            RouteOutcome::Refused => {
                metrics.record_ingest_dropped();
            }
        }
    }

    debug!(peer = %peer, "position_connection_closed");
}
