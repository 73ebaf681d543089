//! Configuration loading from TOML files
//!
//! The binary picks the file with `--config <path>`, then the `CONFIG_FILE`
//! environment variable, then `config/dev.toml` (see `Args` in main.rs).
//!
//! Every section and field has a default, so a partial file is valid.

use crate::io::position_listener::PositionListenerConfig;
use crate::io::position_source::SourceOptions;
use crate::services::session::TrackingSettings;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Where attendance events are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Structured log line per event
    Log,
    /// Append to a JSONL file
    File,
    /// POST to the attendance backend
    Http,
}

impl SinkMode {
    pub fn as_str(&self) -> &str {
        match self {
            SinkMode::Log => "log",
            SinkMode::File => "file",
            SinkMode::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Organization/site identifier, used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "attendance".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_high_accuracy")]
    pub high_accuracy: bool,
    /// Report a transient timeout when no fix arrives for this long (0 disables)
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
    /// Ignore fixes older than this
    #[serde(default)]
    pub max_sample_age_ms: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            high_accuracy: default_high_accuracy(),
            timeout_ms: default_source_timeout_ms(),
            max_sample_age_ms: None,
        }
    }
}

fn default_high_accuracy() -> bool {
    true
}

fn default_source_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TrackingConfig {
    /// Hysteresis for OUTSIDE<->INSIDE changes (0 = disabled)
    #[serde(default)]
    pub min_dwell_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// TOML file of `[[geofence]]` tables
    #[serde(default = "default_catalog_file")]
    pub file: String,
    /// Reload interval (0 = load once at startup)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { file: default_catalog_file(), refresh_interval_secs: default_refresh_interval_secs() }
    }
}

fn default_catalog_file() -> String {
    "config/geofences.toml".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_listener_enabled")]
    pub listener_enabled: bool,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Per-subject feed buffer between listener and session
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listener_enabled: default_listener_enabled(),
            listener_port: default_listener_port(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

fn default_listener_enabled() -> bool {
    true
}

fn default_listener_port() -> u16 {
    7070
}

fn default_feed_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_mode")]
    pub mode: SinkMode,
    /// File path for `mode = "file"` (JSONL format)
    #[serde(default = "default_sink_file")]
    pub file: String,
    /// Backend URL for `mode = "http"`
    #[serde(default = "default_http_url")]
    pub http_url: String,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: default_sink_mode(),
            file: default_sink_file(),
            http_url: default_http_url(),
            timeout_ms: default_sink_timeout_ms(),
        }
    }
}

fn default_sink_mode() -> SinkMode {
    SinkMode::Log
}

fn default_sink_file() -> String {
    "attendance.jsonl".to_string()
}

fn default_http_url() -> String {
    "http://localhost:8080/api/attendance/events".to_string()
}

fn default_sink_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    high_accuracy: bool,
    source_timeout_ms: u64,
    max_sample_age_ms: Option<u64>,
    min_dwell_ms: u64,
    catalog_file: String,
    catalog_refresh_interval_secs: u64,
    listener_enabled: bool,
    listener_port: u16,
    feed_capacity: usize,
    sink_mode: SinkMode,
    sink_file: String,
    sink_http_url: String,
    sink_timeout_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            high_accuracy: toml_config.source.high_accuracy,
            source_timeout_ms: toml_config.source.timeout_ms,
            max_sample_age_ms: toml_config.source.max_sample_age_ms,
            min_dwell_ms: toml_config.tracking.min_dwell_ms,
            catalog_file: toml_config.catalog.file,
            catalog_refresh_interval_secs: toml_config.catalog.refresh_interval_secs,
            listener_enabled: toml_config.ingest.listener_enabled,
            listener_port: toml_config.ingest.listener_port,
            feed_capacity: toml_config.ingest.feed_capacity,
            sink_mode: toml_config.sink.mode,
            sink_file: toml_config.sink.file,
            sink_http_url: toml_config.sink.http_url,
            sink_timeout_ms: toml_config.sink.timeout_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from `path`, falling back to defaults on error
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Sampling options handed to every position source
    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            high_accuracy: self.high_accuracy,
            timeout_ms: self.source_timeout_ms,
            max_sample_age_ms: self.max_sample_age_ms,
        }
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings { min_dwell_ms: self.min_dwell_ms, ..TrackingSettings::default() }
    }

    pub fn listener_config(&self) -> PositionListenerConfig {
        PositionListenerConfig { port: self.listener_port, enabled: self.listener_enabled }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn min_dwell_ms(&self) -> u64 {
        self.min_dwell_ms
    }

    pub fn catalog_file(&self) -> PathBuf {
        PathBuf::from(&self.catalog_file)
    }

    /// `None` when periodic reload is disabled
    pub fn catalog_refresh_interval(&self) -> Option<Duration> {
        (self.catalog_refresh_interval_secs > 0)
            .then(|| Duration::from_secs(self.catalog_refresh_interval_secs))
    }

    pub fn listener_enabled(&self) -> bool {
        self.listener_enabled
    }

    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    pub fn feed_capacity(&self) -> usize {
        self.feed_capacity
    }

    pub fn sink_mode(&self) -> SinkMode {
        self.sink_mode
    }

    pub fn sink_file(&self) -> &str {
        &self.sink_file
    }

    pub fn sink_http_url(&self) -> &str {
        &self.sink_http_url
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set min_dwell_ms
    #[cfg(test)]
    pub fn with_min_dwell_ms(mut self, ms: u64) -> Self {
        self.min_dwell_ms = ms;
        self
    }
}
