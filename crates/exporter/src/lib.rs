//! Scheduled OpenCost allocation exporter
//!
//! Wires configuration, the export scheduler and the health/metrics API
//! together for the `opencost-exporter` service.

pub mod api;
pub mod config;
pub mod signal;
