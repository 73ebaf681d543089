//! Membership evaluation - per-geofence inside/outside verdicts for one sample

use crate::domain::geo::distance;
use crate::domain::types::{Geofence, GeofenceId, PositionSample};
use crate::services::catalog::CatalogSnapshot;

/// Verdict for one active geofence
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub geofence_id: GeofenceId,
    pub incarnation: u64,
    /// Geometrically inside and within the validity window
    pub inside: bool,
    pub distance_m: f64,
    pub within_radius: bool,
    pub within_window: bool,
}

/// Stateless evaluator of samples against a catalog snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct MembershipEvaluator;

impl MembershipEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Verdicts for every active geofence in the snapshot
    ///
    /// Inactive geofences produce no verdict at all, so the tracker treats
    /// them as absent.
    pub fn evaluate(&self, sample: &PositionSample, snapshot: &CatalogSnapshot) -> Vec<Verdict> {
        snapshot
            .entries
            .iter()
            .filter(|entry| entry.geofence.active)
            .map(|entry| {
                let mut verdict = self.verdict_for(sample, &entry.geofence);
                verdict.incarnation = entry.incarnation;
                verdict
            })
            .collect()
    }

    /// Verdict for one geofence regardless of its `active` flag
    pub fn verdict_for(&self, sample: &PositionSample, geofence: &Geofence) -> Verdict {
        let distance_m = distance(sample.coordinate, geofence.center);
        // Boundary counts as inside
        let within_radius = distance_m <= geofence.radius_m;
        let within_window = geofence.is_open_at(sample.captured_at);

        Verdict {
            geofence_id: geofence.id.clone(),
            incarnation: 0,
            inside: within_radius && within_window,
            distance_m,
            within_radius,
            within_window,
        }
    }
}
