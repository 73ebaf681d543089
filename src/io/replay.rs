//! Replay of recorded position captures
//!
//! A capture is a JSONL file in the ingest frame format, one frame per line.
//! `load_replay` groups the frames by subject (file order is kept within a
//! subject) and `ReplayPositionSource` feeds one subject's frames through the
//! usual subscription pump, optionally paced.

use crate::domain::types::SubjectId;
use crate::infra::metrics::Metrics;
use crate::io::position_listener::parse_frame;
use crate::io::position_source::{spawn_pump, PositionSource, RawFix, SourceError, SourceOptions, Subscription};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Recorded fixes for one subject
#[derive(Debug, Clone)]
pub struct SubjectCapture {
    pub subject_id: SubjectId,
    pub fixes: Vec<RawFix>,
}

/// Read a JSONL capture; blank lines and `#` comments are skipped
pub fn load_replay(path: &Path) -> anyhow::Result<Vec<SubjectCapture>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replay file {}", path.display()))?;

    let mut captures: Vec<SubjectCapture> = Vec::new();
    let mut frames = 0usize;
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (subject_id, fix) = parse_frame(line)
            .with_context(|| format!("{}:{}: invalid frame", path.display(), index + 1))?;
        frames += 1;

        match captures.iter_mut().find(|c| c.subject_id == subject_id) {
            Some(capture) => capture.fixes.push(fix),
            None => captures.push(SubjectCapture { subject_id, fixes: vec![fix] }),
        }
    }

    info!(path = %path.display(), frames = %frames, subjects = %captures.len(), "replay_loaded");
    Ok(captures)
}

/// Source that plays back a fixed list of fixes, then ends
pub struct ReplayPositionSource {
    fixes: Option<Vec<RawFix>>,
    pace: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ReplayPositionSource {
    pub fn new(fixes: Vec<RawFix>) -> Self {
        Self { fixes: Some(fixes), pace: Duration::ZERO, metrics: None }
    }

    /// Delay before each fix is released
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl From<SubjectCapture> for ReplayPositionSource {
    fn from(capture: SubjectCapture) -> Self {
        Self::new(capture.fixes)
    }
}

impl PositionSource for ReplayPositionSource {
    fn subscribe(&mut self, options: &SourceOptions) -> Result<Subscription, SourceError> {
        let fixes = self.fixes.take().ok_or(SourceError::AlreadySubscribed)?;
        let pace = self.pace;
        let (feed_tx, feed_rx) = mpsc::channel(16);

        info!(fixes = %fixes.len(), pace_ms = %pace.as_millis(), "replay_subscribed");

        tokio::spawn(async move {
            for fix in fixes {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                // Pump gone means the subscription was cancelled
                if feed_tx.send(fix).await.is_err() {
                    break;
                }
            }
            debug!("replay_feed_finished");
        });

        Ok(spawn_pump(feed_rx, options, self.metrics.clone()))
    }
}
