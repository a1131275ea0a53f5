//! OpenCost allocation export library
//!
//! This crate provides the core functionality for:
//! - Querying the OpenCost allocation API
//! - Flattening allocation windows into tabular records
//! - Encoding records as CSV, JSON or Parquet
//! - Publishing artifacts to date-partitioned object storage
//! - Running and scheduling exports with bounded retry
//! - Health checks and observability

pub mod error;
pub mod fetcher;
pub mod flatten;
pub mod health;
pub mod models;
pub mod observability;
pub mod publish;
pub mod runner;
pub mod scheduler;
pub mod writer;

pub use error::ExportError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ExportMetrics, RunLogger};
pub use runner::{ExportRequest, ExportRunner, RetryPolicy, RunnerConfig};
pub use scheduler::{ExportScheduler, RunGuards, ScheduleSpec, TriggerOutcome};
