//! HTTP attendance sink - POSTs each event as JSON to the backend

use crate::domain::types::AttendanceEvent;
use crate::io::sink::{AttendanceSink, SinkError};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        info!(url = %url, timeout_ms = %timeout.as_millis(), "http_sink_initialized");
        Ok(Self { url: url.to_string(), client })
    }
}

#[async_trait]
impl AttendanceSink for HttpSink {
    async fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        let start = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("Idempotency-Key", event.event_id.as_str())
            .body(event.to_json())
            .send()
            .await;

        let latency_us = start.elapsed().as_micros() as u64;
        match response {
            Ok(response) if response.status().is_success() => {
                info!(
                    event_id = %event.event_id,
                    status = %response.status().as_u16(),
                    latency_us = %latency_us,
                    "http_sink_recorded"
                );
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                error!(
                    event_id = %event.event_id,
                    status = %status,
                    latency_us = %latency_us,
                    "http_sink_rejected"
                );
                Err(SinkError::Rejected(status))
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    error = %e,
                    latency_us = %latency_us,
                    "http_sink_transport_error"
                );
                Err(SinkError::Transport(e.to_string()))
            }
        }
    }
}
