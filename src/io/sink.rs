//! Attendance sinks - where emitted entry/exit events are delivered
//!
//! The engine treats delivery as at-most-once: tracker state has already
//! advanced when `record` is called, so a failure is reported but never
//! retried by the session.

use crate::domain::types::AttendanceEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink transport failed: {0}")]
    Transport(String),
    #[error("sink rejected event with status {0}")]
    Rejected(u16),
    #[error("sink is closed")]
    Closed,
}

/// Receiver of attendance events (backend persistence)
#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError>;
}

/// Writes each event as a structured log line
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AttendanceSink for LogSink {
    async fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        info!(
            event_id = %event.event_id,
            subject_id = %event.subject_id,
            geofence_id = %event.geofence_id,
            kind = %event.kind.as_str(),
            at = %event.at,
            coordinate = %event.coordinate,
            trigger = ?event.trigger,
            "attendance_event"
        );
        Ok(())
    }
}

/// Forwards events into an mpsc channel (in-process event stream)
pub struct ChannelSink {
    tx: mpsc::Sender<AttendanceEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<AttendanceEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiving end of its event stream
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AttendanceEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl AttendanceSink for ChannelSink {
    async fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        self.tx.send(event.clone()).await.map_err(|_| SinkError::Closed)
    }
}
