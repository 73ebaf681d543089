//! Geofence catalog - read-mostly, copy-on-write collection of geofences
//!
//! Evaluation takes an `Arc<CatalogSnapshot>` per sample; writers build a new
//! snapshot and swap it in under the write lock, so readers never observe a
//! partially updated geofence.

use crate::domain::types::{Geofence, GeofenceId, ValidationError};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("duplicate geofence id {0} in reload")]
    DuplicateId(GeofenceId),
}

/// A geofence plus the incarnation it was inserted under
///
/// A new incarnation is assigned whenever an id enters the catalog while
/// absent; updates keep it. Tracker state is bound to the incarnation.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub geofence: Geofence,
    pub incarnation: u64,
}

/// Immutable view of the catalog at one point in time
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub entries: Vec<CatalogEntry>,
}

impl CatalogSnapshot {
    pub fn get(&self, id: &GeofenceId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| &e.geofence.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Result of a full reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub inserted: Vec<GeofenceId>,
    pub updated: Vec<GeofenceId>,
    pub removed: Vec<GeofenceId>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct CatalogState {
    snapshot: Arc<CatalogSnapshot>,
    next_incarnation: u64,
}

impl CatalogState {
    fn take_incarnation(&mut self) -> u64 {
        self.next_incarnation += 1;
        self.next_incarnation
    }

    fn publish(&mut self, entries: Vec<CatalogEntry>) -> u64 {
        let version = self.snapshot.version + 1;
        self.snapshot = Arc::new(CatalogSnapshot { version, entries });
        version
    }
}

/// Shared geofence catalog for one organization
pub struct GeofenceCatalog {
    state: RwLock<CatalogState>,
}

impl GeofenceCatalog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CatalogState {
                snapshot: Arc::new(CatalogSnapshot::default()),
                next_incarnation: 0,
            }),
        }
    }

    /// Consistent snapshot for one evaluation pass
    #[inline]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.state.read().snapshot.clone()
    }

    /// Geofences in catalog order, taken from a single snapshot
    pub fn list(&self) -> Vec<Geofence> {
        self.snapshot().entries.iter().map(|e| e.geofence.clone()).collect()
    }

    pub fn get(&self, id: &GeofenceId) -> Option<Geofence> {
        self.snapshot().get(id).map(|e| e.geofence.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new geofence or replace the definition of an existing one
    pub fn upsert(&self, geofence: Geofence) -> Result<UpsertOutcome, CatalogError> {
        geofence.validate()?;

        let mut state = self.state.write();
        let mut entries = state.snapshot.entries.clone();
        let outcome = match entries.iter_mut().find(|e| e.geofence.id == geofence.id) {
            Some(entry) => {
                entry.geofence = geofence.clone();
                UpsertOutcome::Updated
            }
            None => {
                let incarnation = state.take_incarnation();
                entries.push(CatalogEntry { geofence: geofence.clone(), incarnation });
                UpsertOutcome::Inserted
            }
        };
        let version = state.publish(entries);

        debug!(
            geofence_id = %geofence.id,
            label = %geofence.label(),
            radius_m = %geofence.radius_m,
            active = %geofence.active,
            outcome = ?outcome,
            version = %version,
            "geofence_upserted"
        );
        Ok(outcome)
    }

    /// Remove a geofence; returns whether it was present
    pub fn remove(&self, id: &GeofenceId) -> bool {
        let mut state = self.state.write();
        let before = state.snapshot.entries.len();
        let entries: Vec<CatalogEntry> =
            state.snapshot.entries.iter().filter(|e| &e.geofence.id != id).cloned().collect();
        if entries.len() == before {
            return false;
        }
        let version = state.publish(entries);
        debug!(geofence_id = %id, version = %version, "geofence_removed");
        true
    }

    /// Replace the whole catalog (periodic full reload)
    ///
    /// Every geofence is validated before anything changes; on error the
    /// current catalog stays in force.
    pub fn replace_all(&self, geofences: Vec<Geofence>) -> Result<CatalogDiff, CatalogError> {
        let mut seen = FxHashSet::default();
        for geofence in &geofences {
            geofence.validate()?;
            if !seen.insert(geofence.id.clone()) {
                return Err(CatalogError::DuplicateId(geofence.id.clone()));
            }
        }

        let mut state = self.state.write();
        let current = state.snapshot.clone();
        let mut diff = CatalogDiff::default();
        let mut entries = Vec::with_capacity(geofences.len());

        for geofence in geofences {
            match current.get(&geofence.id) {
                Some(existing) => {
                    if existing.geofence != geofence {
                        diff.updated.push(geofence.id.clone());
                    }
                    entries.push(CatalogEntry { geofence, incarnation: existing.incarnation });
                }
                None => {
                    diff.inserted.push(geofence.id.clone());
                    let incarnation = state.take_incarnation();
                    entries.push(CatalogEntry { geofence, incarnation });
                }
            }
        }
        diff.removed = current
            .entries
            .iter()
            .filter(|e| !seen.contains(&e.geofence.id))
            .map(|e| e.geofence.id.clone())
            .collect();

        let version = state.publish(entries);
        info!(
            version = %version,
            inserted = %diff.inserted.len(),
            updated = %diff.updated.len(),
            removed = %diff.removed.len(),
            "catalog_replaced"
        );
        Ok(diff)
    }
}

impl Default for GeofenceCatalog {
    fn default() -> Self {
        Self::new()
    }
}
