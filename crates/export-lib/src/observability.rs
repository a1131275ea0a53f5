//! Observability for export runs
//!
//! Provides:
//! - Prometheus metrics (runs by outcome, stage latency, attempts, artifact size)
//! - Structured run lifecycle logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{ExportRun, RunOutcome, Stage};

/// Stage latency buckets in seconds; fetches of large clusters take minutes
const STAGE_LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

static GLOBAL_METRICS: OnceLock<ExportMetricsInner> = OnceLock::new();

struct ExportMetricsInner {
    runs_total: IntCounterVec,
    skipped_triggers_total: IntCounterVec,
    records_exported_total: IntCounter,
    artifact_bytes_total: IntCounter,
    stage_latency_seconds: HistogramVec,
    stage_attempts_total: IntCounterVec,
    last_success_timestamp: IntGauge,
}

impl ExportMetricsInner {
    fn new() -> Self {
        Self {
            runs_total: register_int_counter_vec!(
                "opencost_export_runs_total",
                "Export runs by outcome and failing stage",
                &["outcome", "stage"]
            )
            .expect("Failed to register runs_total"),

            skipped_triggers_total: register_int_counter_vec!(
                "opencost_export_skipped_triggers_total",
                "Triggers skipped because a run for the same schedule was in flight",
                &["schedule"]
            )
            .expect("Failed to register skipped_triggers_total"),

            records_exported_total: register_int_counter!(
                "opencost_export_records_total",
                "Allocation records written by successful runs"
            )
            .expect("Failed to register records_exported_total"),

            artifact_bytes_total: register_int_counter!(
                "opencost_export_artifact_bytes_total",
                "Bytes of artifacts produced by successful runs"
            )
            .expect("Failed to register artifact_bytes_total"),

            stage_latency_seconds: register_histogram_vec!(
                "opencost_export_stage_latency_seconds",
                "Time spent in each pipeline stage, retries included",
                &["stage"],
                STAGE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register stage_latency_seconds"),

            stage_attempts_total: register_int_counter_vec!(
                "opencost_export_stage_attempts_total",
                "Attempts made by the network stages",
                &["stage"]
            )
            .expect("Failed to register stage_attempts_total"),

            last_success_timestamp: register_int_gauge!(
                "opencost_export_last_success_timestamp_seconds",
                "Unix time the last successful run finished"
            )
            .expect("Failed to register last_success_timestamp"),
        }
    }
}

/// Handle to the process-wide export metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct ExportMetrics {
    _private: (),
}

impl Default for ExportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExportMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static ExportMetricsInner {
        GLOBAL_METRICS.get_or_init(ExportMetricsInner::new)
    }

    pub fn observe_stage_latency(&self, stage: Stage, duration_secs: f64) {
        self.inner()
            .stage_latency_seconds
            .with_label_values(&[stage.as_str()])
            .observe(duration_secs);
    }

    pub fn inc_skipped_trigger(&self, schedule: &str) {
        self.inner()
            .skipped_triggers_total
            .with_label_values(&[schedule])
            .inc();
    }

    /// Record a finished run
    pub fn record_run(&self, run: &ExportRun) {
        let inner = self.inner();
        inner
            .stage_attempts_total
            .with_label_values(&[Stage::Fetching.as_str()])
            .inc_by(u64::from(run.attempts.fetch));
        inner
            .stage_attempts_total
            .with_label_values(&[Stage::Publishing.as_str()])
            .inc_by(u64::from(run.attempts.publish));

        match &run.outcome {
            RunOutcome::Succeeded => {
                inner.runs_total.with_label_values(&["succeeded", ""]).inc();
                inner.records_exported_total.inc_by(run.record_count as u64);
                if let Some(artifact) = &run.artifact {
                    inner.artifact_bytes_total.inc_by(artifact.size_bytes as u64);
                }
                inner.last_success_timestamp.set(run.finished_at.timestamp());
            }
            RunOutcome::Failed { stage, .. } => {
                inner
                    .runs_total
                    .with_label_values(&["failed", stage.as_str()])
                    .inc();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn runs_total(&self, outcome: &str, stage: &str) -> u64 {
        self.inner()
            .runs_total
            .with_label_values(&[outcome, stage])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn skipped_triggers(&self, schedule: &str) -> u64 {
        self.inner()
            .skipped_triggers_total
            .with_label_values(&[schedule])
            .get()
    }
}

/// Structured logger for run lifecycle events
#[derive(Clone)]
pub struct RunLogger {
    exporter: String,
}

impl RunLogger {
    pub fn new(exporter: impl Into<String>) -> Self {
        Self {
            exporter: exporter.into(),
        }
    }

    pub fn log_startup(&self, version: &str, schedules: usize) {
        info!(
            event = "exporter_started",
            exporter = %self.exporter,
            version = %version,
            schedules = schedules,
            "OpenCost exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            exporter = %self.exporter,
            reason = %reason,
            "OpenCost exporter shutting down"
        );
    }

    /// Log a completed run
    pub fn log_run(&self, run: &ExportRun) {
        let duration_ms = run.duration().num_milliseconds();
        let schedule = run.schedule.as_deref().unwrap_or("manual");

        match &run.outcome {
            RunOutcome::Succeeded => {
                info!(
                    event = "export_succeeded",
                    exporter = %self.exporter,
                    run_id = %run.run_id,
                    schedule = %schedule,
                    window = %run.window,
                    format = %run.format,
                    records = run.record_count,
                    target = ?run.target,
                    sha256 = ?run.artifact.as_ref().map(|a| a.sha256.as_str()),
                    fetch_attempts = run.attempts.fetch,
                    publish_attempts = run.attempts.publish,
                    duration_ms = duration_ms,
                    "Export run succeeded"
                );
            }
            RunOutcome::Failed { stage, kind, cause } => {
                warn!(
                    event = "export_failed",
                    exporter = %self.exporter,
                    run_id = %run.run_id,
                    schedule = %schedule,
                    window = %run.window,
                    format = %run.format,
                    stage = %stage,
                    error_kind = %kind,
                    cause = %cause,
                    fetch_attempts = run.attempts.fetch,
                    publish_attempts = run.attempts.publish,
                    duration_ms = duration_ms,
                    "Export run failed"
                );
            }
        }
    }

    /// Log a trigger dropped because its schedule was busy
    pub fn log_skipped(&self, schedule: &str) {
        warn!(
            event = "export_skipped",
            exporter = %self.exporter,
            schedule = %schedule,
            "Previous run still in flight, skipping trigger"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExportFormat, StageAttempts};
    use chrono::Utc;
    use uuid::Uuid;

    fn failed_run() -> ExportRun {
        let now = Utc::now();
        ExportRun {
            run_id: Uuid::new_v4(),
            schedule: Some("metrics-test".into()),
            window: "yesterday".into(),
            aggregate: vec!["namespace".into()],
            format: ExportFormat::Csv,
            record_count: 0,
            target: None,
            artifact: None,
            attempts: StageAttempts { fetch: 3, publish: 0 },
            outcome: RunOutcome::Failed {
                stage: Stage::Fetching,
                kind: "TransportError".into(),
                cause: "connection refused".into(),
            },
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_failed_run_counted_by_stage() {
        let metrics = ExportMetrics::new();
        let before = metrics.runs_total("failed", "fetching");

        metrics.record_run(&failed_run());
        metrics.observe_stage_latency(Stage::Fetching, 0.5);

        assert!(metrics.runs_total("failed", "fetching") > before);
    }

    #[test]
    fn test_run_logger_creation() {
        let logger = RunLogger::new("aks-prod");
        assert_eq!(logger.exporter, "aks-prod");
        logger.log_run(&failed_run());
    }
}
