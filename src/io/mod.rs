//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `position_source` - Position source trait, subscriptions, channel-fed source
//! - `replay` - Recorded capture playback
//! - `position_listener` - TCP listener for device position frames
//! - `catalog_feed` - Geofence file loading and periodic refresh
//! - `sink` - Attendance sink trait plus log and channel sinks
//! - `egress` - Attendance events to file (JSONL format)
//! - `http_sink` - Attendance events to the backend over HTTP
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod catalog_feed;
pub mod egress;
pub mod http_sink;
pub mod position_listener;
pub mod position_source;
pub mod prometheus;
pub mod replay;
pub mod sink;

// Re-export commonly used types
pub use catalog_feed::{load_geofences, run_catalog_refresh};
pub use egress::JsonlSink;
pub use http_sink::HttpSink;
pub use position_listener::{start_position_listener, PositionListenerConfig, SubjectRouter};
pub use position_source::{
    ChannelPositionSource, PositionSource, RawFix, SourceError, SourceOptions, Subscription,
};
pub use replay::{load_replay, ReplayPositionSource};
pub use sink::{AttendanceSink, ChannelSink, LogSink, SinkError};
