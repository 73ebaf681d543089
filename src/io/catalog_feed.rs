//! Geofence catalog feed - file-backed full reloads
//!
//! The backend publishes the organization's geofences as a TOML file of
//! `[[geofence]]` tables. The refresh task re-reads it on an interval and
//! swaps the catalog contents in one step.

use crate::domain::types::Geofence;
use crate::infra::metrics::Metrics;
use crate::services::catalog::GeofenceCatalog;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct GeofenceFile {
    #[serde(default)]
    geofence: Vec<Geofence>,
}

/// Parse a geofence file; validation happens when the catalog applies it
pub fn load_geofences(path: &Path) -> anyhow::Result<Vec<Geofence>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read geofence file {}", path.display()))?;
    let file: GeofenceFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse geofence file {}", path.display()))?;
    Ok(file.geofence)
}

/// Load `path` into the catalog once
pub fn reload_catalog(catalog: &GeofenceCatalog, path: &Path, metrics: &Metrics) -> anyhow::Result<()> {
    let geofences = load_geofences(path)?;
    let diff = catalog
        .replace_all(geofences)
        .with_context(|| format!("rejected geofence file {}", path.display()))?;
    metrics.set_geofences(catalog.len());

    if diff.is_empty() {
        debug!(path = %path.display(), "catalog_unchanged");
    } else {
        info!(
            path = %path.display(),
            inserted = %diff.inserted.len(),
            updated = %diff.updated.len(),
            removed = %diff.removed.len(),
            total = %catalog.len(),
            "catalog_reloaded"
        );
    }
    Ok(())
}

/// Re-read the geofence file every `interval` until shutdown
///
/// A failed reload is logged and the catalog keeps its previous contents.
pub async fn run_catalog_refresh(
    catalog: Arc<GeofenceCatalog>,
    path: PathBuf,
    interval: Duration,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; the caller already did the initial load
    ticker.tick().await;

    info!(path = %path.display(), interval_secs = %interval.as_secs(), "catalog_refresh_started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("catalog_refresh_shutdown");
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = reload_catalog(&catalog, &path, &metrics) {
                    warn!(path = %path.display(), error = %format!("{e:#}"), "catalog_reload_failed");
                }
            }
        }
    }
}
