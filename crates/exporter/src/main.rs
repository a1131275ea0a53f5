//! OpenCost exporter - scheduled allocation export service
//!
//! Runs inside the cluster next to OpenCost, exporting allocation data to
//! object storage on a fixed interval and serving health and metrics.

use anyhow::{Context, Result};
use export_lib::{
    fetcher::{AllocationClient, AllocationSource},
    health::{components, HealthRegistry},
    observability::{ExportMetrics, RunLogger},
    publish::{ObjectStorePublisher, Publisher},
    ExportRunner, ExportScheduler,
};
use opencost_exporter::{api, config::ExporterConfig, signal::ShutdownSignals};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting opencost-exporter");
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    let config = ExporterConfig::load()?;
    info!(
        api_url = %config.api_url,
        schedule = %config.schedule_name,
        window = %config.window,
        format = %config.format,
        "Exporter configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::FETCHER).await;
    health_registry.register(components::PUBLISHER).await;

    let metrics = ExportMetrics::new();
    let logger = RunLogger::new(&config.schedule_name);

    let source: Arc<dyn AllocationSource> = Arc::new(
        AllocationClient::new(config.client_config()).context("failed to build allocation client")?,
    );
    let publisher: Option<Arc<dyn Publisher>> = match config.storage_target() {
        Some(target) => Some(Arc::new(
            ObjectStorePublisher::new(&target).context("failed to configure storage target")?,
        )),
        None => None,
    };

    let runner = ExportRunner::new(source, publisher, config.runner_config())
        .with_health(health_registry.clone());
    let scheduler = Arc::new(ExportScheduler::new(Arc::new(runner), health_registry.clone()));
    let schedule = config.schedule()?;

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(vec![schedule], shutdown.clone()));

    health_registry.set_ready(true).await;
    logger.log_startup(EXPORTER_VERSION, 1);

    let signal = signals.recv().await;
    logger.log_shutdown(&format!("{} received", signal));
    shutdown.cancel();

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
