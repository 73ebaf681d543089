//! Attendance egress - appends events to a file
//!
//! Events are written in JSONL format (one JSON object per line)
//! to the file specified in config. Writes go through `tokio::fs` so a
//! session waiting on the file never blocks a runtime worker.

use crate::domain::types::AttendanceEvent;
use crate::io::sink::{AttendanceSink, SinkError};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// JSONL file sink for attendance events
pub struct JsonlSink {
    file_path: String,
    /// Serializes appends from concurrent sessions
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string(), write_lock: Mutex::new(()) }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Append a line to the egress file
    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}

#[async_trait]
impl AttendanceSink for JsonlSink {
    async fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        match self.append_line(&event.to_json()).await {
            Ok(()) => {
                debug!(
                    event_id = %event.event_id,
                    subject_id = %event.subject_id,
                    geofence_id = %event.geofence_id,
                    kind = %event.kind.as_str(),
                    "event_egressed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    error = %e,
                    "event_egress_failed"
                );
                Err(SinkError::Io(e))
            }
        }
    }
}
