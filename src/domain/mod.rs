//! Domain models - geofences, position samples, membership and events
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identifiers, `Coordinate`, `Geofence`, `PositionSample`,
//!   `MembershipState` and `AttendanceEvent`
//! - `geo` - haversine great-circle distance

pub mod geo;
pub mod types;

pub use geo::distance;
pub use types::{
    AttendanceEvent, Coordinate, EventKind, Geofence, GeofenceId, MembershipState,
    PositionSample, SubjectId, Trigger, WorkingHours,
};
