//! Demand-driven GPU telemetry streaming.
//!
//! NVML is only held open while at least one client is subscribed; snapshots
//! are pushed to subscribers as JSON once per polling interval.

pub mod config;
pub mod controller;
pub mod data;
pub mod hub;
pub mod logging;
pub mod monitor;
pub mod server;
