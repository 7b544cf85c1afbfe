//! Pipewise: A/B experiment controller for telemetry pipelines
//!
//! Runs a baseline and a candidate pipeline configuration side by side,
//! collects metrics from both, and decides statistically whether the
//! candidate should be promoted.

pub mod config;
pub mod controller;
pub mod model;
pub mod server;
pub mod store;
