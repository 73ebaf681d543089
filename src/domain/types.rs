//! Shared types for the geofence attendance engine

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Generate a new UUID v7 (time-ordered) string
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrapper for tracked subject (employee) IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for geofence IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeofenceId(pub String);

impl GeofenceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GeofenceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Coordinate construction errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeoError {
    #[error("latitude {0} outside [-90, 90]")]
    InvalidLatitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    InvalidLongitude(f64),
}

/// WGS84 latitude/longitude in degrees, valid by construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = GeoError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }
        Ok(Self { latitude, longitude })
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Daily validity window in the geofence's local time
///
/// `start` is inclusive and `end` exclusive. When `start > end` the window
/// runs overnight and the part after midnight belongs to the previous day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    #[serde(serialize_with = "serialize_hhmm", deserialize_with = "deserialize_hhmm")]
    pub start: NaiveTime,
    #[serde(serialize_with = "serialize_hhmm", deserialize_with = "deserialize_hhmm")]
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.is_overnight() {
            time >= self.start || time < self.end
        } else {
            self.start <= time && time < self.end
        }
    }
}

fn serialize_hhmm<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = if time.second() == 0 {
        time.format("%H:%M").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    };
    serializer.serialize_str(&formatted)
}

fn deserialize_hhmm<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
        .map_err(|e| serde::de::Error::custom(format!("invalid time of day {raw:?}: {e}")))
}

/// Geofence definition rejected before it reaches evaluation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("geofence id is empty")]
    EmptyId,
    #[error("geofence {id}: radius {radius_m} m must be a positive number")]
    NonPositiveRadius { id: GeofenceId, radius_m: f64 },
    #[error("geofence {id}: working hours start and end are equal")]
    EmptyWorkingHours { id: GeofenceId },
    #[error("geofence {id}: utc offset {minutes} min is out of range")]
    InvalidUtcOffset { id: GeofenceId, minutes: i32 },
}

fn default_active() -> bool {
    true
}

/// Named circular region with an optional day/time-of-day validity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: GeofenceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub center: Coordinate,
    pub radius_m: f64,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Empty means every day
    #[serde(default)]
    pub allowed_days: Vec<Weekday>,
    /// Absent means all day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_hours: Option<WorkingHours>,
    /// Local time of the geofence as a fixed offset from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Geofence {
    pub fn new(id: impl Into<String>, center: Coordinate, radius_m: f64) -> Self {
        Self {
            id: GeofenceId(id.into()),
            name: None,
            center,
            radius_m,
            active: true,
            allowed_days: Vec::new(),
            working_hours: None,
            utc_offset_minutes: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_allowed_days(mut self, days: &[Weekday]) -> Self {
        self.allowed_days = days.to_vec();
        self
    }

    pub fn with_working_hours(mut self, hours: WorkingHours) -> Self {
        self.working_hours = Some(hours);
        self
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Label for logs: name if set, otherwise the id
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn local_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.0.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(ValidationError::NonPositiveRadius {
                id: self.id.clone(),
                radius_m: self.radius_m,
            });
        }
        if let Some(hours) = &self.working_hours {
            if hours.start == hours.end {
                return Err(ValidationError::EmptyWorkingHours { id: self.id.clone() });
            }
        }
        if self.local_offset().is_none() {
            return Err(ValidationError::InvalidUtcOffset {
                id: self.id.clone(),
                minutes: self.utc_offset_minutes,
            });
        }
        Ok(())
    }

    /// Whether attendance may be counted at `at` (allowed days and working hours)
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        let Some(offset) = self.local_offset() else {
            return false;
        };
        let local = at.with_timezone(&offset);
        let time = local.time();
        let mut day = local.weekday();

        if let Some(hours) = &self.working_hours {
            if !hours.contains(time) {
                return false;
            }
            if hours.is_overnight() && time < hours.end {
                day = day.pred();
            }
        }

        self.allowed_days.is_empty() || self.allowed_days.contains(&day)
    }
}

/// Single location fix for one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub subject_id: SubjectId,
    pub coordinate: Coordinate,
    pub accuracy_m: f64,
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(
        subject_id: SubjectId,
        coordinate: Coordinate,
        accuracy_m: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self { subject_id, coordinate, accuracy_m: accuracy_m.max(0.0), captured_at }
    }
}

/// Membership of one subject in one geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MembershipState {
    /// No sample evaluated yet for this pair
    #[default]
    Unknown,
    Outside,
    Inside,
}

impl MembershipState {
    /// Apply a verdict, returning the next state and the event it produces
    ///
    /// Leaving `Unknown` never produces an event.
    pub fn next(self, inside: bool) -> (MembershipState, Option<EventKind>) {
        match (self, inside) {
            (MembershipState::Unknown, true) => (MembershipState::Inside, None),
            (MembershipState::Unknown, false) => (MembershipState::Outside, None),
            (MembershipState::Outside, true) => (MembershipState::Inside, Some(EventKind::Entry)),
            (MembershipState::Inside, false) => (MembershipState::Outside, Some(EventKind::Exit)),
            (state, _) => (state, None),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MembershipState::Unknown => "unknown",
            MembershipState::Outside => "outside",
            MembershipState::Inside => "inside",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
        }
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// A position sample crossed the boundary
    Sample,
    /// The geofence was removed or deactivated while the subject was inside
    Withdrawn,
}

/// Entry/exit event handed to the attendance sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub event_id: String,
    pub subject_id: SubjectId,
    pub geofence_id: GeofenceId,
    pub kind: EventKind,
    /// `captured_at` of the triggering sample
    pub at: DateTime<Utc>,
    pub coordinate: Coordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    pub trigger: Trigger,
}

impl AttendanceEvent {
    pub fn new(
        sample: &PositionSample,
        geofence_id: GeofenceId,
        kind: EventKind,
        trigger: Trigger,
    ) -> Self {
        Self {
            event_id: new_uuid_v7(),
            subject_id: sample.subject_id.clone(),
            geofence_id,
            kind,
            at: sample.captured_at,
            coordinate: sample.coordinate,
            distance_m: None,
            trigger,
        }
    }

    pub fn with_distance(mut self, distance_m: f64) -> Self {
        self.distance_m = Some(distance_m);
        self
    }

    pub fn to_json(&self) -> String {
        // Plain data, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hhmm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn office() -> Geofence {
        Geofence::new("hq", Coordinate::new(0.0, 0.0).unwrap(), 100.0)
    }

    #[test]
    fn test_coordinate_rejects_out_of_range() {
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert_eq!(Coordinate::new(90.1, 0.0), Err(GeoError::InvalidLatitude(90.1)));
        assert_eq!(Coordinate::new(0.0, -180.5), Err(GeoError::InvalidLongitude(-180.5)));
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_coordinate_deserialize_validates() {
        let ok: Coordinate = serde_json::from_str(r#"{"latitude":1.5,"longitude":2.5}"#).unwrap();
        assert_eq!(ok.latitude(), 1.5);
        let bad = serde_json::from_str::<Coordinate>(r#"{"latitude":91,"longitude":0}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_membership_transition_function() {
        use MembershipState::*;
        assert_eq!(Unknown.next(true), (Inside, None));
        assert_eq!(Unknown.next(false), (Outside, None));
        assert_eq!(Outside.next(true), (Inside, Some(EventKind::Entry)));
        assert_eq!(Inside.next(false), (Outside, Some(EventKind::Exit)));
        assert_eq!(Inside.next(true), (Inside, None));
        assert_eq!(Outside.next(false), (Outside, None));
    }

    #[test]
    fn test_validate_rejects_bad_radius() {
        let mut g = office();
        g.radius_m = 0.0;
        assert!(matches!(g.validate(), Err(ValidationError::NonPositiveRadius { .. })));
        g.radius_m = f64::INFINITY;
        assert!(g.validate().is_err());
        g.radius_m = 1.0;
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_id_and_window() {
        let mut g = office();
        g.id = GeofenceId(" ".to_string());
        assert_eq!(g.validate(), Err(ValidationError::EmptyId));

        let g = office().with_working_hours(WorkingHours::new(hhmm(9, 0), hhmm(9, 0)));
        assert!(matches!(g.validate(), Err(ValidationError::EmptyWorkingHours { .. })));

        let g = office().with_utc_offset_minutes(24 * 60);
        assert!(matches!(g.validate(), Err(ValidationError::InvalidUtcOffset { .. })));
    }

    #[test]
    fn test_open_at_respects_days_and_hours() {
        // 2026-10-19 is a Monday
        let g = office()
            .with_allowed_days(&[Weekday::Mon, Weekday::Tue])
            .with_working_hours(WorkingHours::new(hhmm(9, 0), hhmm(17, 0)));

        assert!(g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()));
        assert!(g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 16, 59, 59).unwrap()));
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 17, 0, 0).unwrap()));
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 8, 59, 0).unwrap()));
        // Sunday
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_open_at_uses_local_offset() {
        // UTC+05:30: 04:00 UTC is 09:30 local
        let g = office()
            .with_working_hours(WorkingHours::new(hhmm(9, 0), hhmm(17, 0)))
            .with_utc_offset_minutes(330);
        assert!(g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap()));
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_overnight_window_counts_against_previous_day() {
        // Friday night shift 22:00-06:00
        let g = office()
            .with_allowed_days(&[Weekday::Fri])
            .with_working_hours(WorkingHours::new(hhmm(22, 0), hhmm(6, 0)));

        // Friday 2026-10-23 23:00
        assert!(g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 23, 23, 0, 0).unwrap()));
        // Saturday 03:00 belongs to Friday's shift
        assert!(g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 24, 3, 0, 0).unwrap()));
        // Friday 03:00 belongs to Thursday's shift
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 23, 3, 0, 0).unwrap()));
        // Saturday 12:00 outside hours
        assert!(!g.is_open_at(Utc.with_ymd_and_hms(2026, 10, 24, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_geofence_from_toml() {
        let raw = r#"
id = "hq-main"
name = "Head office"
center = { latitude = 64.1466, longitude = -21.9426 }
radius_m = 150.0
allowed_days = ["Mon", "Tue", "Wed", "Thu", "Fri"]
working_hours = { start = "08:30", end = "17:00:30" }
utc_offset_minutes = 0
"#;
        let g: Geofence = toml::from_str(raw).unwrap();
        assert_eq!(g.id, GeofenceId::from("hq-main"));
        assert_eq!(g.label(), "Head office");
        assert!(g.active);
        assert_eq!(g.allowed_days.len(), 5);
        let hours = g.working_hours.unwrap();
        assert_eq!(hours.start, hhmm(8, 30));
        assert_eq!(hours.end, NaiveTime::from_hms_opt(17, 0, 30).unwrap());
    }

    #[test]
    fn test_event_json_shape() {
        let sample = PositionSample::new(
            SubjectId::from("emp-7"),
            Coordinate::new(1.0, 2.0).unwrap(),
            5.0,
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
        );
        let event =
            AttendanceEvent::new(&sample, GeofenceId::from("hq"), EventKind::Entry, Trigger::Sample)
                .with_distance(12.5);
        let parsed: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(parsed["kind"], "entry");
        assert_eq!(parsed["trigger"], "sample");
        assert_eq!(parsed["subject_id"], "emp-7");
        assert_eq!(parsed["geofence_id"], "hq");
        assert_eq!(parsed["distance_m"], 12.5);
        assert_eq!(event.event_id.len(), 36);
    }
}
