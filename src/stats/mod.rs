// src/stats/mod.rs
//! Statistics collection
//!
//! Tracked values for the monitoring plane: per-device and per-pool share
//! counters, scan-time sliding windows and process start times. The
//! supervisor writes, command handlers and push streams read.

/// The tracked-values hub implementation
pub mod tracker;

// Re-export main components
pub use tracker::{DeviceShareStats, PoolShareStats, ScanWindow, StartTimes, Tracking, now_secs};
