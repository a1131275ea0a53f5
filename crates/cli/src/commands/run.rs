//! `oce run`: one on-demand export

use anyhow::{bail, Context, Result};
use colored::Colorize;
use export_lib::fetcher::{AllocationClient, ClientConfig};
use export_lib::publish::{ObjectStorePublisher, Publisher, StorageTarget, DEFAULT_BLOB_PREFIX};
use export_lib::{ExportFormat, ExportRequest, ExportRun, ExportRunner, RetryPolicy, RunOutcome, RunnerConfig};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::output::{format_bytes, print_error, print_json, print_success, print_table, OutputFormat};
use crate::RunArgs;

#[derive(Tabled, Serialize)]
struct SummaryRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Run one export and report it; the exit code reflects the outcome
pub async fn run_export(
    api_url: &str,
    args: RunArgs,
    file_config: &Config,
    output: OutputFormat,
) -> Result<ExitCode> {
    let format = resolve_format(&args, file_config)?;
    let target = resolve_target(&args, file_config)?;
    if target.is_none() && !args.skip_upload {
        bail!(
            "no storage target: pass --storage-account and --storage-container, \
             --local-storage-dir, or --skip-upload"
        );
    }

    let fetch_timeout = Duration::from_secs(args.query.timeout_secs);
    let client = AllocationClient::new(ClientConfig {
        base_url: api_url.to_string(),
        timeout: fetch_timeout,
        ..ClientConfig::default()
    })
    .context("Failed to create allocation client")?;

    let publisher: Option<Arc<dyn Publisher>> = match (&target, args.skip_upload) {
        (Some(target), false) => Some(Arc::new(
            ObjectStorePublisher::new(target).context("Failed to configure storage target")?,
        )),
        _ => None,
    };

    let config = RunnerConfig {
        fetch_timeout,
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            ..RetryPolicy::default()
        },
        blob_prefix: args
            .prefix
            .clone()
            .or_else(|| file_config.blob_prefix.clone())
            .unwrap_or_else(|| DEFAULT_BLOB_PREFIX.to_string()),
        output_dir: args.output_dir.clone(),
        skip_upload: args.skip_upload,
        ..RunnerConfig::default()
    };
    let runner = ExportRunner::new(Arc::new(client), publisher, config);

    let mut request = ExportRequest::new(args.query.to_query(), format);
    if let Some(filename) = &args.filename {
        request = request.with_filename(filename.clone());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let run = runner.run(&request, &cancel).await;
    report(&run, output);

    Ok(match &run.outcome {
        RunOutcome::Succeeded => ExitCode::SUCCESS,
        RunOutcome::Failed { stage, kind, cause } => {
            print_error(&format!("export failed at {} stage: {}: {}", stage, kind, cause));
            ExitCode::FAILURE
        }
    })
}

fn resolve_format(args: &RunArgs, file_config: &Config) -> Result<ExportFormat> {
    if let Some(format) = args.format {
        return Ok(format.into());
    }
    match &file_config.default_format {
        Some(format) => Ok(format.parse::<ExportFormat>()?),
        None => Ok(ExportFormat::default()),
    }
}

fn resolve_target(args: &RunArgs, file_config: &Config) -> Result<Option<StorageTarget>> {
    if let Some(root) = &args.local_storage_dir {
        return Ok(Some(StorageTarget::Local { root: root.clone() }));
    }

    let account = args
        .storage_account
        .clone()
        .or_else(|| file_config.storage_account.clone());
    let container = args
        .storage_container
        .clone()
        .or_else(|| file_config.storage_container.clone());

    match (account, container) {
        (Some(account), Some(container)) => Ok(Some(StorageTarget::Azure {
            account,
            container,
            access_key: args.storage_key.clone(),
        })),
        (None, None) => Ok(None),
        _ => bail!("--storage-account and --storage-container must be given together"),
    }
}

fn report(run: &ExportRun, output: OutputFormat) {
    if let OutputFormat::Json = output {
        print_json(run);
        return;
    }

    let status = match &run.outcome {
        RunOutcome::Succeeded => "succeeded".green().to_string(),
        RunOutcome::Failed { stage, .. } => format!("failed ({})", stage).red().to_string(),
    };
    let mut rows = vec![
        SummaryRow {
            field: "Run ID",
            value: run.run_id.to_string(),
        },
        SummaryRow {
            field: "Status",
            value: status,
        },
        SummaryRow {
            field: "Window",
            value: run.window.clone(),
        },
        SummaryRow {
            field: "Format",
            value: run.format.to_string(),
        },
        SummaryRow {
            field: "Records",
            value: run.record_count.to_string(),
        },
        SummaryRow {
            field: "Attempts",
            value: format!("fetch {}, publish {}", run.attempts.fetch, run.attempts.publish),
        },
        SummaryRow {
            field: "Duration",
            value: format!("{}ms", run.duration().num_milliseconds()),
        },
    ];
    if let Some(artifact) = &run.artifact {
        rows.push(SummaryRow {
            field: "Artifact",
            value: format!("{} ({})", artifact.filename, format_bytes(artifact.size_bytes as u64)),
        });
        rows.push(SummaryRow {
            field: "SHA-256",
            value: artifact.sha256.clone(),
        });
    }
    if let Some(target) = &run.target {
        rows.push(SummaryRow {
            field: "Target",
            value: target.clone(),
        });
    }

    print_table(&rows, output);
    if run.outcome.is_success() {
        print_success(&format!("Exported {} allocation records", run.record_count));
    }
}
