//! Tests for the TransitionTracker

use super::*;
use crate::domain::types::{Coordinate, EventKind, Geofence};
use crate::services::catalog::GeofenceCatalog;
use crate::services::evaluator::MembershipEvaluator;
use chrono::{Duration, TimeZone};

const INSIDE: (f64, f64) = (0.0, 0.0);
const OUTSIDE: (f64, f64) = (0.0, 0.002);

/// Test harness wiring a catalog and evaluator to one tracker
struct Harness {
    catalog: GeofenceCatalog,
    tracker: TransitionTracker,
    clock: DateTime<Utc>,
}

impl Harness {
    fn new() -> Self {
        Self::with_min_dwell_ms(0)
    }

    fn with_min_dwell_ms(ms: u64) -> Self {
        let catalog = GeofenceCatalog::new();
        catalog.upsert(fence("hq")).unwrap();
        Self {
            catalog,
            tracker: TransitionTracker::new(SubjectId::from("emp-1")).with_min_dwell_ms(ms),
            // Monday 09:00 UTC
            clock: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
        }
    }

    /// Feed a sample 10 seconds after the previous one
    fn feed(&mut self, at: (f64, f64)) -> Vec<AttendanceEvent> {
        self.clock += Duration::seconds(10);
        let sample = PositionSample::new(
            SubjectId::from("emp-1"),
            Coordinate::new(at.0, at.1).unwrap(),
            5.0,
            self.clock,
        );
        let verdicts = MembershipEvaluator::new().evaluate(&sample, &self.catalog.snapshot());
        self.tracker.apply(&sample, &verdicts)
    }

    fn state(&self, id: &str) -> MembershipState {
        self.tracker.state(&GeofenceId::from(id))
    }
}

fn fence(id: &str) -> Geofence {
    Geofence::new(id, Coordinate::new(0.0, 0.0).unwrap(), 100.0)
}

fn kinds(events: &[AttendanceEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

#[test]
fn test_first_sample_never_emits() {
    let mut inside = Harness::new();
    assert!(inside.feed(INSIDE).is_empty());
    assert_eq!(inside.state("hq"), MembershipState::Inside);

    let mut outside = Harness::new();
    assert!(outside.feed(OUTSIDE).is_empty());
    assert_eq!(outside.state("hq"), MembershipState::Outside);
}

#[test]
fn test_unknown_before_any_sample() {
    let h = Harness::new();
    assert_eq!(h.state("hq"), MembershipState::Unknown);
    assert_eq!(h.tracker.tracked(), 0);
}

#[test]
fn test_single_entry_on_third_sample() {
    let mut h = Harness::new();
    assert!(h.feed(OUTSIDE).is_empty());
    assert!(h.feed(OUTSIDE).is_empty());

    let third = h.feed(INSIDE);
    assert_eq!(kinds(&third), vec![EventKind::Entry]);
    assert_eq!(third[0].geofence_id, GeofenceId::from("hq"));
    assert_eq!(third[0].at, h.clock);
    assert_eq!(third[0].trigger, Trigger::Sample);

    assert!(h.feed(INSIDE).is_empty());

    let exit = h.feed(OUTSIDE);
    assert_eq!(kinds(&exit), vec![EventKind::Exit]);
    assert!(h.feed(OUTSIDE).is_empty());
}

#[test]
fn test_event_carries_sample_details() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);
    let events = h.feed(INSIDE);
    let event = &events[0];
    assert_eq!(event.subject_id, SubjectId::from("emp-1"));
    assert_eq!(event.coordinate, Coordinate::new(0.0, 0.0).unwrap());
    assert_eq!(event.distance_m, Some(0.0));
}

#[test]
fn test_two_geofences_enter_independently() {
    let mut h = Harness::new();
    h.catalog.upsert(fence("annex")).unwrap();
    h.catalog
        .upsert(Geofence::new("remote", Coordinate::new(10.0, 10.0).unwrap(), 100.0))
        .unwrap();

    assert!(h.feed(OUTSIDE).is_empty());
    let events = h.feed(INSIDE);
    assert_eq!(events.len(), 2);
    let mut ids: Vec<_> = events.iter().map(|e| e.geofence_id.as_str().to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["annex", "hq"]);
    assert!(events.iter().all(|e| e.kind == EventKind::Entry));
    assert_eq!(h.state("remote"), MembershipState::Outside);
}

#[test]
fn test_removed_geofence_while_inside_emits_withdrawn_exit() {
    let mut h = Harness::new();
    h.feed(INSIDE);
    h.catalog.remove(&GeofenceId::from("hq"));

    let events = h.feed(INSIDE);
    assert_eq!(kinds(&events), vec![EventKind::Exit]);
    assert_eq!(events[0].trigger, Trigger::Withdrawn);
    assert_eq!(events[0].distance_m, None);
    assert_eq!(h.state("hq"), MembershipState::Unknown);
    assert_eq!(h.tracker.tracked(), 0);
}

#[test]
fn test_removed_geofence_while_outside_is_silent() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);
    h.catalog.remove(&GeofenceId::from("hq"));
    assert!(h.feed(OUTSIDE).is_empty());
    assert_eq!(h.tracker.tracked(), 0);
}

#[test]
fn test_readd_resets_to_unknown() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);

    h.catalog.remove(&GeofenceId::from("hq"));
    assert!(h.feed(OUTSIDE).is_empty());
    h.catalog.upsert(fence("hq")).unwrap();

    // Fresh state: first verdict after re-add only initializes
    assert!(h.feed(INSIDE).is_empty());
    assert_eq!(h.state("hq"), MembershipState::Inside);
}

#[test]
fn test_readd_between_samples_still_resets() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);

    // Removed and re-added with no sample in between
    h.catalog.remove(&GeofenceId::from("hq"));
    h.catalog.upsert(fence("hq")).unwrap();

    assert!(h.feed(INSIDE).is_empty());
    assert_eq!(h.state("hq"), MembershipState::Inside);
}

#[test]
fn test_update_keeps_state() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);
    // Grow the radius so the same position is now inside
    let mut bigger = fence("hq");
    bigger.radius_m = 1000.0;
    h.catalog.upsert(bigger).unwrap();

    assert_eq!(kinds(&h.feed(OUTSIDE)), vec![EventKind::Entry]);
}

#[test]
fn test_deactivation_while_inside_emits_exit() {
    let mut h = Harness::new();
    h.feed(INSIDE);
    h.catalog.upsert(fence("hq").with_active(false)).unwrap();

    let events = h.feed(INSIDE);
    assert_eq!(kinds(&events), vec![EventKind::Exit]);
    assert_eq!(events[0].trigger, Trigger::Withdrawn);

    // Reactivated: starts over from Unknown
    h.catalog.upsert(fence("hq")).unwrap();
    assert!(h.feed(INSIDE).is_empty());
}

#[test]
fn test_reset_discards_state() {
    let mut h = Harness::new();
    h.feed(OUTSIDE);
    h.tracker.reset();
    assert!(h.feed(INSIDE).is_empty());
}

#[test]
fn test_min_dwell_suppresses_jitter() {
    // 25s dwell, samples every 10s
    let mut h = Harness::with_min_dwell_ms(25_000);
    h.feed(OUTSIDE);

    // Brief excursion inside, then back out: nothing emitted
    assert!(h.feed(INSIDE).is_empty());
    assert!(h.feed(INSIDE).is_empty());
    assert!(h.feed(OUTSIDE).is_empty());
    assert_eq!(h.state("hq"), MembershipState::Outside);

    // Sustained presence commits on the sample that reaches the dwell
    assert!(h.feed(INSIDE).is_empty()); // t=0
    assert!(h.feed(INSIDE).is_empty()); // t=10s
    assert!(h.feed(INSIDE).is_empty()); // t=20s
    assert_eq!(kinds(&h.feed(INSIDE)), vec![EventKind::Entry]); // t=30s
    assert_eq!(h.state("hq"), MembershipState::Inside);
}

#[test]
fn test_min_dwell_does_not_delay_initialization() {
    let mut h = Harness::with_min_dwell_ms(60_000);
    assert!(h.feed(INSIDE).is_empty());
    assert_eq!(h.state("hq"), MembershipState::Inside);
}

#[test]
fn test_outside_working_hours_exits() {
    let mut h = Harness::new();
    h.catalog
        .upsert(fence("hq").with_working_hours(crate::domain::types::WorkingHours::new(
            chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(9, 0, 30).unwrap(),
        )))
        .unwrap();

    // 09:00:10 and 09:00:20 are inside the window
    h.feed(OUTSIDE);
    assert_eq!(kinds(&h.feed(INSIDE)), vec![EventKind::Entry]);
    // 09:00:30 is past the window end: same position now counts as outside
    assert_eq!(kinds(&h.feed(INSIDE)), vec![EventKind::Exit]);
}
