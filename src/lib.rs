//! Geofence attendance library
//!
//! Membership evaluation and entry/exit detection for attendance tracking.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
