//! OpenCost allocation export CLI
//!
//! Runs one-off exports of OpenCost allocation data to object storage and
//! previews the flattened records an export would contain.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use export_lib::fetcher::AllocationQuery;
use export_lib::publish::DEFAULT_BLOB_PREFIX;
use export_lib::ExportFormat;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Fallback when neither flags, environment nor the config file name an API
const DEFAULT_API_URL: &str = "http://localhost:9003";

/// OpenCost allocation export CLI
#[derive(Parser)]
#[command(name = "oce")]
#[command(author, version, about = "CLI for OpenCost allocation exports", long_about = None)]
pub struct Cli {
    /// OpenCost API base URL (can also be set via OCE_API_URL env var)
    #[arg(long, global = true, env = "OCE_API_URL")]
    pub api_url: Option<String>,

    /// How results are printed
    #[arg(long, short, global = true, default_value = "table")]
    pub output: output::OutputFormat,

    /// Enable verbose logging on stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one export: fetch, flatten, write and upload
    Run(RunArgs),

    /// Fetch and flatten allocations without writing an artifact
    Preview(PreviewArgs),
}

/// Allocation query parameters shared by every command
#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Window specifier (e.g. yesterday, 7d, month, 2024-01-01T00:00:00Z,2024-01-02T00:00:00Z)
    #[arg(long, short, env = "OCE_WINDOW", default_value = "yesterday")]
    pub window: String,

    /// Comma-separated aggregation dimensions
    #[arg(long, short, env = "OCE_AGGREGATE", default_value = "namespace,pod")]
    pub aggregate: String,

    /// Return one set per sub-window instead of accumulating the window
    #[arg(long)]
    pub no_accumulate: bool,

    /// Include idle allocations
    #[arg(long)]
    pub include_idle: bool,

    /// Share idle cost across allocations
    #[arg(long)]
    pub share_idle: Option<bool>,

    /// Compute idle cost per node
    #[arg(long)]
    pub idle_by_node: Option<bool>,

    /// Allocation query timeout in seconds
    #[arg(long, env = "OCE_FETCH_TIMEOUT_SECS", default_value_t = 90)]
    pub timeout_secs: u64,
}

impl QueryArgs {
    pub fn to_query(&self) -> AllocationQuery {
        let mut query = AllocationQuery::new(
            self.window.clone(),
            AllocationQuery::parse_aggregate(&self.aggregate),
        )
        .with_accumulate(!self.no_accumulate)
        .with_include_idle(self.include_idle);
        if let Some(share_idle) = self.share_idle {
            query = query.with_share_idle(share_idle);
        }
        if let Some(idle_by_node) = self.idle_by_node {
            query = query.with_idle_by_node(idle_by_node);
        }
        query
    }
}

/// Artifact encodings accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Csv,
    Json,
    Parquet,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Parquet => ExportFormat::Parquet,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Artifact format
    #[arg(long, short, env = "OCE_FORMAT")]
    pub format: Option<FormatArg>,

    /// Azure storage account
    #[arg(long, env = "OCE_STORAGE_ACCOUNT")]
    pub storage_account: Option<String>,

    /// Azure blob container
    #[arg(long, env = "OCE_STORAGE_CONTAINER")]
    pub storage_container: Option<String>,

    /// Azure storage account key (falls back to the AZURE_* environment)
    #[arg(long, env = "OCE_STORAGE_KEY", hide_env_values = true)]
    pub storage_key: Option<String>,

    /// Publish into a local directory instead of Azure
    #[arg(long, env = "OCE_LOCAL_STORAGE_DIR", conflicts_with_all = ["storage_account", "storage_container"])]
    pub local_storage_dir: Option<PathBuf>,

    /// Blob prefix in front of the date partition
    #[arg(long, env = "OCE_BLOB_PREFIX")]
    pub prefix: Option<String>,

    /// Fixed artifact filename, replacing the timestamped default
    #[arg(long)]
    pub filename: Option<String>,

    /// Keep a local copy of the artifact in this directory
    #[arg(long, short = 'd', env = "OCE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Write the artifact locally and skip the upload
    #[arg(long, env = "OCE_SKIP_UPLOAD")]
    pub skip_upload: bool,

    /// Attempts per network stage
    #[arg(long, default_value_t = export_lib::runner::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Maximum rows to print (0 prints every row)
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let file_config = config::Config::load()?;
    let api_url = cli
        .api_url
        .clone()
        .or_else(|| file_config.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    match cli.command {
        Commands::Run(args) => commands::run::run_export(&api_url, args, &file_config, cli.output).await,
        Commands::Preview(args) => {
            commands::preview::preview(&api_url, args, cli.output).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
