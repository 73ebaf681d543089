//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `catalog` - Copy-on-write geofence catalog with atomic snapshots
//! - `evaluator` - Per-geofence inside/outside verdicts for one sample
//! - `transition` - Per-subject membership state machine
//! - `session` - Monitoring sessions and the `Monitor` entry point

pub mod catalog;
pub mod evaluator;
pub mod session;
pub mod transition;

// Re-export commonly used types
pub use catalog::{CatalogError, GeofenceCatalog};
pub use evaluator::{MembershipEvaluator, Verdict};
pub use session::{Monitor, MonitorError, SessionExit, SessionHandle, SessionNotice, TrackingSettings};
pub use transition::TransitionTracker;
