//! Per-geofence membership state machine for one subject
//!
//! Consumes verdicts in sample arrival order and emits Entry/Exit events
//! exactly on OUTSIDE<->INSIDE changes:
//! - The first verdict for a geofence only initializes state (no event)
//! - Repeated identical verdicts are no-ops
//! - A geofence that disappears from the verdict set (removed, deactivated,
//!   or re-added under a new incarnation) is forgotten, with an implicit Exit
//!   if the subject was inside
//! - Optional hysteresis: with `min_dwell_ms > 0` an opposing verdict must
//!   persist that long (sample time) before the change is committed

#[cfg(test)]
mod tests;

use crate::domain::types::{
    AttendanceEvent, EventKind, GeofenceId, MembershipState, PositionSample, SubjectId, Trigger,
};
use crate::services::evaluator::Verdict;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Tracked state for one geofence
#[derive(Debug, Clone)]
struct Tracked {
    incarnation: u64,
    state: MembershipState,
    /// When the current run of opposing verdicts started (hysteresis only)
    pending_since: Option<DateTime<Utc>>,
}

/// Membership state machine for one subject across all geofences
pub struct TransitionTracker {
    subject_id: SubjectId,
    states: FxHashMap<GeofenceId, Tracked>,
    min_dwell_ms: u64,
}

impl TransitionTracker {
    pub fn new(subject_id: SubjectId) -> Self {
        Self { subject_id, states: FxHashMap::default(), min_dwell_ms: 0 }
    }

    /// Require opposing verdicts to persist for `ms` before a transition
    pub fn with_min_dwell_ms(mut self, ms: u64) -> Self {
        self.min_dwell_ms = ms;
        self
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Current state for a geofence (`Unknown` if never evaluated)
    pub fn state(&self, geofence_id: &GeofenceId) -> MembershipState {
        self.states.get(geofence_id).map(|t| t.state).unwrap_or_default()
    }

    /// Number of geofences with tracked state
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Drop all state; every geofence starts over at `Unknown`
    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Apply the verdicts computed from one sample
    ///
    /// State is advanced before events are returned, so a failed delivery
    /// never causes the same transition to be emitted twice.
    pub fn apply(&mut self, sample: &PositionSample, verdicts: &[Verdict]) -> Vec<AttendanceEvent> {
        let mut events = self.withdraw_missing(sample, verdicts);

        for verdict in verdicts {
            let tracked = self.states.entry(verdict.geofence_id.clone()).or_insert_with(|| Tracked {
                incarnation: verdict.incarnation,
                state: MembershipState::Unknown,
                pending_since: None,
            });

            let current = tracked.state;
            if current == MembershipState::Unknown {
                let (next, _) = current.next(verdict.inside);
                tracked.state = next;
                debug!(
                    subject_id = %self.subject_id,
                    geofence_id = %verdict.geofence_id,
                    state = %next.as_str(),
                    distance_m = format!("{:.1}", verdict.distance_m),
                    "membership_initialized"
                );
                continue;
            }

            let (next, kind) = current.next(verdict.inside);
            let Some(kind) = kind else {
                tracked.pending_since = None;
                continue;
            };

            if self.min_dwell_ms > 0 {
                let since = *tracked.pending_since.get_or_insert(sample.captured_at);
                let held_ms = (sample.captured_at - since).num_milliseconds();
                if held_ms < self.min_dwell_ms as i64 {
                    debug!(
                        subject_id = %self.subject_id,
                        geofence_id = %verdict.geofence_id,
                        target = %next.as_str(),
                        held_ms = %held_ms,
                        min_dwell_ms = %self.min_dwell_ms,
                        "transition_pending"
                    );
                    continue;
                }
            }

            tracked.state = next;
            tracked.pending_since = None;

            info!(
                subject_id = %self.subject_id,
                geofence_id = %verdict.geofence_id,
                kind = %kind.as_str(),
                distance_m = format!("{:.1}", verdict.distance_m),
                at = %sample.captured_at,
                "membership_transition"
            );
            events.push(
                AttendanceEvent::new(sample, verdict.geofence_id.clone(), kind, Trigger::Sample)
                    .with_distance(verdict.distance_m),
            );
        }

        events
    }

    /// Forget geofences absent from this evaluation pass
    fn withdraw_missing(
        &mut self,
        sample: &PositionSample,
        verdicts: &[Verdict],
    ) -> Vec<AttendanceEvent> {
        let live: FxHashMap<&GeofenceId, u64> =
            verdicts.iter().map(|v| (&v.geofence_id, v.incarnation)).collect();

        let mut withdrawn = Vec::new();
        let subject_id = &self.subject_id;
        self.states.retain(|geofence_id, tracked| {
            if live.get(geofence_id) == Some(&tracked.incarnation) {
                return true;
            }
            debug!(
                subject_id = %subject_id,
                geofence_id = %geofence_id,
                state = %tracked.state.as_str(),
                "membership_withdrawn"
            );
            if tracked.state == MembershipState::Inside {
                info!(
                    subject_id = %subject_id,
                    geofence_id = %geofence_id,
                    kind = "exit",
                    "membership_transition_withdrawn"
                );
                withdrawn.push(AttendanceEvent::new(
                    sample,
                    geofence_id.clone(),
                    EventKind::Exit,
                    Trigger::Withdrawn,
                ));
            }
            false
        });
        withdrawn
    }
}
