//! Export run orchestration
//!
//! Drives one run through `Fetching → Flattening → Writing → Publishing`
//! on a single task. Only the two network stages are retried; every
//! network call honors its timeout and the run's cancellation token.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ExportError;
use crate::fetcher::{AllocationQuery, AllocationSource, DEFAULT_FETCH_TIMEOUT};
use crate::flatten::{system_clock, Clock, Flattener};
use crate::health::{components, HealthRegistry};
use crate::models::{ArtifactSummary, ExportFormat, ExportRun, RunOutcome, RunState, Stage, StageAttempts};
use crate::observability::{ExportMetrics, RunLogger};
use crate::publish::{blob_path, Publisher, DEFAULT_BLOB_PREFIX};
use crate::writer::{artifact_filename, Artifact, ArtifactWriter};

/// Attempts per network stage, first try included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default bound on a single upload
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded retry with doubling backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without waiting
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub fetch_timeout: Duration,
    pub publish_timeout: Duration,
    pub retry: RetryPolicy,
    pub blob_prefix: String,
    /// Directory that receives a local copy of every artifact
    pub output_dir: Option<PathBuf>,
    /// Stop after Writing; the artifact is kept locally only
    pub skip_upload: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            retry: RetryPolicy::default(),
            blob_prefix: DEFAULT_BLOB_PREFIX.to_string(),
            output_dir: None,
            skip_upload: false,
        }
    }
}

/// Parameters of one export
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub query: AllocationQuery,
    pub format: ExportFormat,
    /// Fixed artifact filename; derived from the run timestamp when unset
    pub filename: Option<String>,
    /// Schedule identity the run belongs to
    pub schedule: Option<String>,
}

impl ExportRequest {
    pub fn new(query: AllocationQuery, format: ExportFormat) -> Self {
        Self {
            query,
            format,
            filename: None,
            schedule: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }
}

/// Mutable bookkeeping of a run in progress
#[derive(Debug)]
struct RunProgress {
    state: RunState,
    attempts: StageAttempts,
    record_count: usize,
    target: Option<String>,
    artifact: Option<ArtifactSummary>,
}

impl RunProgress {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            attempts: StageAttempts::default(),
            record_count: 0,
            target: None,
            artifact: None,
        }
    }

    fn enter(&mut self, stage: Stage) -> Result<(), (Stage, ExportError)> {
        self.state.enter(stage).map_err(|e| (stage, e))?;
        debug!(stage = %stage, "Entering stage");
        Ok(())
    }
}

/// Runs the export pipeline
pub struct ExportRunner {
    source: Arc<dyn AllocationSource>,
    publisher: Option<Arc<dyn Publisher>>,
    writer: ArtifactWriter,
    config: RunnerConfig,
    clock: Clock,
    metrics: ExportMetrics,
    logger: RunLogger,
    health: Option<HealthRegistry>,
}

impl ExportRunner {
    pub fn new(
        source: Arc<dyn AllocationSource>,
        publisher: Option<Arc<dyn Publisher>>,
        config: RunnerConfig,
    ) -> Self {
        let logger = RunLogger::new(source.endpoint());
        Self {
            source,
            publisher,
            writer: ArtifactWriter::new(),
            config,
            clock: system_clock(),
            metrics: ExportMetrics::new(),
            logger,
            health: None,
        }
    }

    pub fn with_writer(mut self, writer: ArtifactWriter) -> Self {
        self.writer = writer;
        self
    }

    /// Clock used for the run timestamp and record stamps
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute one run to completion
    ///
    /// Never panics or returns early: every failure is reported through
    /// the returned run's outcome.
    pub async fn run(&self, request: &ExportRequest, cancel: &CancellationToken) -> ExportRun {
        let run_id = Uuid::new_v4();
        let started_at = (self.clock)();
        let span = info_span!(
            "export_run",
            run_id = %run_id,
            schedule = request.schedule.as_deref().unwrap_or("manual"),
            format = %request.format,
        );

        let mut progress = RunProgress::new();
        let result = self
            .execute(request, cancel, started_at, &mut progress)
            .instrument(span)
            .await;

        let outcome = match result {
            Ok(()) => {
                progress.state = RunState::Succeeded;
                RunOutcome::Succeeded
            }
            Err((stage, err)) => {
                progress.state = RunState::Failed {
                    stage,
                    cause: err.to_string(),
                };
                self.report_failure(stage, &err).await;
                RunOutcome::Failed {
                    stage,
                    kind: err.kind().to_string(),
                    cause: err.to_string(),
                }
            }
        };

        let run = ExportRun {
            run_id,
            schedule: request.schedule.clone(),
            window: request.query.window.clone(),
            aggregate: request.query.aggregate.clone(),
            format: request.format,
            record_count: progress.record_count,
            target: progress.target,
            artifact: progress.artifact,
            attempts: progress.attempts,
            outcome,
            started_at,
            finished_at: (self.clock)(),
        };

        self.metrics.record_run(&run);
        self.logger.log_run(&run);
        run
    }

    async fn execute(
        &self,
        request: &ExportRequest,
        cancel: &CancellationToken,
        run_timestamp: DateTime<Utc>,
        progress: &mut RunProgress,
    ) -> Result<(), (Stage, ExportError)> {
        // Fetching
        progress.enter(Stage::Fetching)?;
        let stage_start = Instant::now();
        let source = &self.source;
        let query = &request.query;
        let fetch_timeout = self.config.fetch_timeout;
        let response = self
            .with_retry(Stage::Fetching, cancel, &mut progress.attempts.fetch, move || {
                guarded("allocation query", fetch_timeout, cancel, source.fetch(query))
            })
            .await
            .map_err(|e| (Stage::Fetching, e))?;
        self.finish_stage(Stage::Fetching, stage_start);
        self.mark_healthy(components::FETCHER).await;

        // Flattening
        progress.enter(Stage::Flattening)?;
        let stage_start = Instant::now();
        let records = Flattener::new(&response)
            .map(|f| f.with_clock(self.clock.clone()))
            .and_then(|f| f.collect())
            .map_err(|e| (Stage::Flattening, e))?;
        drop(response);
        progress.record_count = records.len();
        self.finish_stage(Stage::Flattening, stage_start);

        // Writing
        progress.enter(Stage::Writing)?;
        let stage_start = Instant::now();
        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| artifact_filename(run_timestamp, request.format));
        let artifact = self
            .writer
            .write(&records, request.format, filename)
            .map_err(|e| (Stage::Writing, e))?;
        drop(records);
        progress.artifact = Some(artifact.summary());

        let local_dir = match (&self.config.output_dir, self.config.skip_upload) {
            (Some(dir), _) => Some(dir.clone()),
            (None, true) => Some(PathBuf::from(".")),
            (None, false) => None,
        };
        if let Some(dir) = local_dir {
            let saved = self
                .save_local(&artifact, &dir, cancel)
                .await
                .map_err(|e| (Stage::Writing, e))?;
            progress.target = Some(saved.display().to_string());
        }
        self.finish_stage(Stage::Writing, stage_start);

        if self.config.skip_upload {
            info!(
                filename = %artifact.filename,
                records = artifact.record_count,
                "Upload skipped, artifact kept locally"
            );
            return Ok(());
        }

        // Publishing
        progress.enter(Stage::Publishing)?;
        let stage_start = Instant::now();
        let publisher = self.publisher.as_ref().ok_or_else(|| {
            (
                Stage::Publishing,
                ExportError::Config("no storage target configured".to_string()),
            )
        })?;
        let path = blob_path(&self.config.blob_prefix, run_timestamp, &artifact.filename);
        let artifact_ref = &artifact;
        let path_ref = path.as_str();
        let publish_timeout = self.config.publish_timeout;
        let receipt = self
            .with_retry(Stage::Publishing, cancel, &mut progress.attempts.publish, move || {
                guarded(
                    "artifact upload",
                    publish_timeout,
                    cancel,
                    publisher.publish(artifact_ref, path_ref),
                )
            })
            .await
            .map_err(|e| (Stage::Publishing, e))?;
        progress.target = Some(receipt.location);
        self.finish_stage(Stage::Publishing, stage_start);
        self.mark_healthy(components::PUBLISHER).await;

        Ok(())
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    async fn with_retry<T, F, Fut>(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        attempts: &mut u32,
        mut op: F,
    ) -> Result<T, ExportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExportError>>,
    {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);

        loop {
            *attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && *attempts < max_attempts => {
                    let delay = policy.backoff_after(*attempts);
                    warn!(
                        stage = %stage,
                        attempt = *attempts,
                        max_attempts = max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ExportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn save_local(
        &self,
        artifact: &Artifact,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ExportError> {
        let mut saving = tokio::spawn({
            let artifact = artifact.clone();
            let dir = dir.to_path_buf();
            async move { artifact.save_to(&dir).await }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The write runs on the blocking pool and outlives a dropped future
                let _ = (&mut saving).await;
                if let Err(e) = artifact.discard_staging(dir).await {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove staging file");
                }
                Err(ExportError::Cancelled)
            }
            joined = &mut saving => match joined {
                Ok(saved) => saved,
                Err(e) => Err(ExportError::Io(std::io::Error::other(e))),
            },
        }
    }

    fn finish_stage(&self, stage: Stage, started: Instant) {
        let elapsed = started.elapsed();
        self.metrics.observe_stage_latency(stage, elapsed.as_secs_f64());
        debug!(stage = %stage, elapsed_ms = elapsed.as_millis() as u64, "Stage complete");
    }

    async fn mark_healthy(&self, component: &str) {
        if let Some(health) = &self.health {
            health.set_healthy(component).await;
        }
    }

    async fn report_failure(&self, stage: Stage, err: &ExportError) {
        let Some(health) = &self.health else {
            return;
        };
        let message = err.to_string();
        match (stage, err) {
            (_, ExportError::Cancelled) => {}
            (Stage::Fetching, _) => health.set_degraded(components::FETCHER, message).await,
            (Stage::Publishing, ExportError::Auth(_) | ExportError::Config(_)) => {
                health.set_unhealthy(components::PUBLISHER, message).await
            }
            (Stage::Publishing, _) => health.set_degraded(components::PUBLISHER, message).await,
            _ => {}
        }
    }
}

/// Bound `fut` by `timeout` and `cancel`
async fn guarded<T, Fut>(
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T, ExportError>
where
    Fut: Future<Output = Result<T, ExportError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExportError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ExportError::Timeout { operation, after: timeout }),
        },
    }
}
