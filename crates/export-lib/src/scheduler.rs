//! Recurring export schedules
//!
//! Each named schedule ticks on its own interval. A tick spawns a run, and
//! a tick that lands while the previous run of the same schedule is still
//! in flight is skipped. Schedules share nothing but the lock registry.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::{components, HealthRegistry};
use crate::models::ExportRun;
use crate::observability::{ExportMetrics, RunLogger};
use crate::runner::{ExportRequest, ExportRunner};

/// Default recurrence of a schedule
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest accepted recurrence
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// A named, recurring export
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    /// Schedule identity; at most one run per name is in flight
    pub name: String,
    pub interval: Duration,
    /// Fire immediately instead of waiting one interval
    pub run_on_start: bool,
    pub request: ExportRequest,
}

impl ScheduleSpec {
    pub fn new(name: impl Into<String>, request: ExportRequest) -> Self {
        Self {
            name: name.into(),
            interval: DEFAULT_INTERVAL,
            run_on_start: true,
            request,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }
}

/// What happened to a trigger
#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(Box<ExportRun>),
    /// A run for the same schedule was already in flight
    Skipped,
}

impl TriggerOutcome {
    pub fn run(&self) -> Option<&ExportRun> {
        match self {
            TriggerOutcome::Completed(run) => Some(run.as_ref()),
            TriggerOutcome::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TriggerOutcome::Skipped)
    }
}

/// Registry of per-schedule run locks
#[derive(Debug, Clone, Default)]
pub struct RunGuards {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RunGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `identity` without waiting
    pub fn try_acquire(&self, identity: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }

    /// Whether a run for `identity` currently holds the lock
    pub fn is_running(&self, identity: &str) -> bool {
        self.locks
            .get(identity)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

/// Fires export runs for a set of schedules
pub struct ExportScheduler {
    runner: Arc<ExportRunner>,
    guards: RunGuards,
    health: HealthRegistry,
    metrics: ExportMetrics,
    logger: RunLogger,
}

impl ExportScheduler {
    pub fn new(runner: Arc<ExportRunner>, health: HealthRegistry) -> Self {
        Self {
            runner,
            guards: RunGuards::new(),
            health,
            metrics: ExportMetrics::new(),
            logger: RunLogger::new("scheduler"),
        }
    }

    /// Share a lock registry with other schedulers
    pub fn with_guards(mut self, guards: RunGuards) -> Self {
        self.guards = guards;
        self
    }

    pub fn guards(&self) -> &RunGuards {
        &self.guards
    }

    /// Run `spec` once unless a run for the same schedule is in flight
    pub async fn trigger(&self, spec: &ScheduleSpec, cancel: &CancellationToken) -> TriggerOutcome {
        let Some(_guard) = self.guards.try_acquire(&spec.name) else {
            self.metrics.inc_skipped_trigger(&spec.name);
            self.logger.log_skipped(&spec.name);
            return TriggerOutcome::Skipped;
        };

        let request = spec.request.clone().with_schedule(spec.name.clone());
        let run = self.runner.run(&request, cancel).await;
        TriggerOutcome::Completed(Box::new(run))
    }

    /// Drive every schedule until `cancel` fires
    pub async fn run(self: Arc<Self>, schedules: Vec<ScheduleSpec>, cancel: CancellationToken) {
        self.health.register(components::SCHEDULER).await;
        info!(schedules = schedules.len(), "Starting export scheduler");

        let mut loops = JoinSet::new();
        for spec in schedules {
            loops.spawn(self.clone().run_schedule(spec, cancel.clone()));
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Schedule loop panicked");
                self.health
                    .set_unhealthy(components::SCHEDULER, format!("schedule loop panicked: {}", e))
                    .await;
            }
        }

        info!("Export scheduler stopped");
    }

    async fn run_schedule(self: Arc<Self>, spec: ScheduleSpec, cancel: CancellationToken) {
        if spec.interval.is_zero() {
            warn!(schedule = %spec.name, "Schedule interval is zero, not scheduling");
            return;
        }
        if spec.interval > MAX_INTERVAL {
            error!(
                schedule = %spec.name,
                interval_secs = spec.interval.as_secs(),
                max_interval_secs = MAX_INTERVAL.as_secs(),
                "Schedule interval too long, not scheduling"
            );
            self.health
                .set_unhealthy(
                    components::SCHEDULER,
                    format!(
                        "schedule {} interval exceeds {}s",
                        spec.name,
                        MAX_INTERVAL.as_secs()
                    ),
                )
                .await;
            return;
        }

        let start = if spec.run_on_start {
            Instant::now()
        } else {
            Instant::now() + spec.interval
        };
        let mut ticker = interval_at(start, spec.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            schedule = %spec.name,
            interval_secs = spec.interval.as_secs(),
            run_on_start = spec.run_on_start,
            "Schedule armed"
        );

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(schedule = %spec.name, "Schedule fired");
                    let this = self.clone();
                    let spec = spec.clone();
                    let cancel = cancel.clone();
                    in_flight.spawn(async move { this.trigger(&spec, &cancel).await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(schedule = %spec.name, error = %e, "Export run task panicked");
                    }
                }
            }
        }

        // In-flight runs observe the same token and finish as cancelled
        while in_flight.join_next().await.is_some() {}
        info!(schedule = %spec.name, "Schedule stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::health::ComponentStatus;
    use crate::fetcher::{AllocationQuery, AllocationResponse, AllocationSource};
    use crate::models::{ExportFormat, RunOutcome};
    use crate::publish::{ObjectStorePublisher, StorageTarget};
    use crate::runner::tests::{scenario_a, test_config};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Slow source that records how many fetches overlap
    struct TrackingSource {
        delay: Duration,
        active: AtomicU32,
        max_active: AtomicU32,
        calls: AtomicU32,
    }

    impl TrackingSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicU32::new(0),
                max_active: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AllocationSource for TrackingSource {
        async fn fetch(&self, _query: &AllocationQuery) -> Result<AllocationResponse, ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(scenario_a())
        }

        fn endpoint(&self) -> String {
            "tracking://allocation".to_string()
        }
    }

    fn scheduler(source: Arc<TrackingSource>) -> Arc<ExportScheduler> {
        let publisher = Arc::new(ObjectStorePublisher::new(&StorageTarget::Memory).unwrap());
        let runner = Arc::new(ExportRunner::new(source, Some(publisher), test_config()));
        Arc::new(ExportScheduler::new(runner, HealthRegistry::new()))
    }

    fn spec(name: &str) -> ScheduleSpec {
        ScheduleSpec::new(
            name,
            ExportRequest::new(
                AllocationQuery::new("yesterday", vec!["namespace".into()]),
                ExportFormat::Csv,
            ),
        )
    }

    #[test]
    fn test_run_guards_are_per_identity() {
        let guards = RunGuards::new();
        let held = guards.try_acquire("daily").unwrap();

        assert!(guards.is_running("daily"));
        assert!(guards.try_acquire("daily").is_none());
        assert!(guards.try_acquire("hourly").is_some());

        drop(held);
        assert!(!guards.is_running("daily"));
        assert!(guards.try_acquire("daily").is_some());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let source = Arc::new(TrackingSource::new(Duration::from_millis(200)));
        let scheduler = scheduler(source.clone());
        let spec = spec("overlap-skip");
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(scheduler.trigger(&spec, &cancel), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            scheduler.trigger(&spec, &cancel).await
        });

        let run = first.run().unwrap();
        assert_eq!(run.outcome, RunOutcome::Succeeded);
        assert_eq!(run.schedule.as_deref(), Some("overlap-skip"));
        assert!(second.is_skipped());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.metrics.skipped_triggers("overlap-skip"), 1);

        // Lock is released once the run completes
        assert!(!scheduler.trigger(&spec, &cancel).await.is_skipped());
    }

    #[tokio::test]
    async fn test_distinct_schedules_run_side_by_side() {
        let source = Arc::new(TrackingSource::new(Duration::from_millis(100)));
        let scheduler = scheduler(source.clone());
        let cancel = CancellationToken::new();
        let (a, b) = (spec("side-a"), spec("side-b"));

        let (first, second) =
            tokio::join!(scheduler.trigger(&a, &cancel), scheduler.trigger(&b, &cancel));

        assert!(!first.is_skipped());
        assert!(!second.is_skipped());
        assert_eq!(source.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schedule_loop_never_overlaps_runs() {
        let source = Arc::new(TrackingSource::new(Duration::from_millis(100)));
        let scheduler = scheduler(source.clone());
        let cancel = CancellationToken::new();
        let spec = spec("loop-no-overlap").with_interval(Duration::from_millis(30));

        let handle = tokio::spawn(scheduler.clone().run(vec![spec], cancel.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(source.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
        assert!(scheduler.metrics.skipped_triggers("loop-no-overlap") >= 1);
        assert!(!scheduler.guards().is_running("loop-no-overlap"));
    }

    #[tokio::test]
    async fn test_overlong_interval_is_not_scheduled() {
        let source = Arc::new(TrackingSource::new(Duration::ZERO));
        let scheduler = scheduler(source.clone());
        let spec = spec("too-long")
            .with_interval(Duration::from_secs(u64::MAX))
            .with_run_on_start(false);

        tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.clone().run(vec![spec], CancellationToken::new()),
        )
        .await
        .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        let health = scheduler.health.health().await;
        assert_eq!(
            health.components[components::SCHEDULER].status,
            ComponentStatus::Unhealthy
        );
    }
}
