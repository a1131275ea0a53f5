//! Exporter configuration

use anyhow::{bail, Context, Result};
use export_lib::fetcher::{AllocationQuery, ClientConfig};
use export_lib::publish::{StorageTarget, DEFAULT_BLOB_PREFIX};
use export_lib::scheduler::MAX_INTERVAL;
use export_lib::{ExportFormat, ExportRequest, RetryPolicy, RunnerConfig, ScheduleSpec};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment prefix of every setting (`OCE_API_URL`, `OCE_WINDOW`, ...)
pub const ENV_PREFIX: &str = "OCE";

/// Names an optional TOML/YAML/JSON settings file
pub const CONFIG_FILE_VAR: &str = "OCE_CONFIG_FILE";

/// Exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Schedule identity; one run per name is in flight at a time
    #[serde(default = "default_schedule_name")]
    pub schedule_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// OpenCost cost model endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_window")]
    pub window: String,

    /// Comma-separated aggregation dimensions
    #[serde(default = "default_aggregate")]
    pub aggregate: String,

    #[serde(default = "default_true")]
    pub accumulate: bool,

    #[serde(default)]
    pub include_idle: bool,

    #[serde(default)]
    pub share_idle: Option<bool>,

    #[serde(default)]
    pub idle_by_node: Option<bool>,

    /// csv, json or parquet
    #[serde(default = "default_format")]
    pub format: String,

    /// Fixed artifact filename, for strictly idempotent reruns
    #[serde(default)]
    pub filename: Option<String>,

    #[serde(default)]
    pub storage_account: Option<String>,

    #[serde(default)]
    pub storage_container: Option<String>,

    /// Account key; the Azure SDK environment is used when unset
    #[serde(default)]
    pub storage_key: Option<String>,

    /// Publish into a local directory instead of Azure
    #[serde(default)]
    pub local_storage_dir: Option<PathBuf>,

    #[serde(default = "default_blob_prefix")]
    pub blob_prefix: String,

    /// Keep a local copy of every artifact here
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub skip_upload: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub run_on_start: bool,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn default_schedule_name() -> String {
    "daily".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_url() -> String {
    "http://opencost.opencost:9003".to_string()
}

fn default_window() -> String {
    "yesterday".to_string()
}

fn default_aggregate() -> String {
    "namespace,pod".to_string()
}

fn default_format() -> String {
    "csv".to_string()
}

fn default_blob_prefix() -> String {
    DEFAULT_BLOB_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    24 * 60 * 60
}

fn default_fetch_timeout() -> u64 {
    90
}

fn default_publish_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    export_lib::runner::DEFAULT_MAX_ATTEMPTS
}

fn default_retry_backoff() -> u64 {
    2
}

impl ExporterConfig {
    /// Load configuration from the optional settings file and the environment
    ///
    /// Environment variables win over the file.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_VAR).ok().map(PathBuf::from);
        Self::load_from(config::Environment::with_prefix(ENV_PREFIX), file)
    }

    pub fn load_from(env: config::Environment, file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let settings = builder
            .add_source(env)
            .build()
            .context("failed to read exporter configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("invalid exporter configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        self.export_format()?;
        self.query().validate()?;
        if self.interval_secs == 0 {
            bail!("interval_secs must be greater than zero");
        }
        if Duration::from_secs(self.interval_secs) > MAX_INTERVAL {
            bail!(
                "interval_secs must not exceed {} (one leap year)",
                MAX_INTERVAL.as_secs()
            );
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.storage_account.is_some() != self.storage_container.is_some() {
            bail!("storage_account and storage_container must be set together");
        }
        if !self.skip_upload && self.storage_target().is_none() {
            bail!(
                "no storage target: set {0}_STORAGE_ACCOUNT and {0}_STORAGE_CONTAINER, \
                 {0}_LOCAL_STORAGE_DIR, or {0}_SKIP_UPLOAD=true",
                ENV_PREFIX
            );
        }
        Ok(())
    }

    pub fn export_format(&self) -> Result<ExportFormat> {
        Ok(self.format.parse::<ExportFormat>()?)
    }

    pub fn query(&self) -> AllocationQuery {
        let mut query = AllocationQuery::new(
            self.window.clone(),
            AllocationQuery::parse_aggregate(&self.aggregate),
        )
        .with_accumulate(self.accumulate)
        .with_include_idle(self.include_idle);
        if let Some(share_idle) = self.share_idle {
            query = query.with_share_idle(share_idle);
        }
        if let Some(idle_by_node) = self.idle_by_node {
            query = query.with_idle_by_node(idle_by_node);
        }
        query
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.api_url.clone(),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            ..ClientConfig::default()
        }
    }

    /// Azure wins over a local directory when both are configured
    pub fn storage_target(&self) -> Option<StorageTarget> {
        match (&self.storage_account, &self.storage_container, &self.local_storage_dir) {
            (Some(account), Some(container), _) => Some(StorageTarget::Azure {
                account: account.clone(),
                container: container.clone(),
                access_key: self.storage_key.clone(),
            }),
            (_, _, Some(root)) => Some(StorageTarget::Local { root: root.clone() }),
            _ => None,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_secs(self.retry_backoff_secs),
                ..RetryPolicy::default()
            },
            blob_prefix: self.blob_prefix.clone(),
            output_dir: self.output_dir.clone(),
            skip_upload: self.skip_upload,
        }
    }

    pub fn schedule(&self) -> Result<ScheduleSpec> {
        let mut request = ExportRequest::new(self.query(), self.export_format()?);
        if let Some(filename) = &self.filename {
            request = request.with_filename(filename.clone());
        }
        Ok(ScheduleSpec::new(self.schedule_name.clone(), request)
            .with_interval(Duration::from_secs(self.interval_secs))
            .with_run_on_start(self.run_on_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults_with_skip_upload() {
        let config = ExporterConfig::load_from(env(&[("OCE_SKIP_UPLOAD", "true")]), None).unwrap();

        assert_eq!(config.window, "yesterday");
        assert_eq!(config.query().aggregate, vec!["namespace", "pod"]);
        assert_eq!(config.export_format().unwrap(), ExportFormat::Csv);
        assert_eq!(config.interval_secs, 86_400);
        assert_eq!(config.runner_config().retry.max_attempts, 3);
        assert!(config.storage_target().is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let config = ExporterConfig::load_from(
            env(&[
                ("OCE_API_URL", "http://localhost:9003/model"),
                ("OCE_WINDOW", "7d"),
                ("OCE_AGGREGATE", "cluster, namespace"),
                ("OCE_FORMAT", "json"),
                ("OCE_STORAGE_ACCOUNT", "costexports"),
                ("OCE_STORAGE_CONTAINER", "opencost"),
                ("OCE_INTERVAL_SECS", "3600"),
                ("OCE_SHARE_IDLE", "true"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(config.client_config().base_url, "http://localhost:9003/model");
        assert_eq!(config.query().share_idle, Some(true));
        assert_eq!(
            config.storage_target(),
            Some(StorageTarget::Azure {
                account: "costexports".into(),
                container: "opencost".into(),
                access_key: None,
            })
        );

        let schedule = config.schedule().unwrap();
        assert_eq!(schedule.name, "daily");
        assert_eq!(schedule.interval, Duration::from_secs(3600));
        assert_eq!(schedule.request.format, ExportFormat::Json);
        assert_eq!(schedule.request.query.window, "7d");
    }

    #[test]
    fn test_settings_file_is_overridden_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        std::fs::write(
            &path,
            "window = \"30d\"\nformat = \"parquet\"\nlocal_storage_dir = \"/var/lib/oce\"\n",
        )
        .unwrap();

        let config =
            ExporterConfig::load_from(env(&[("OCE_WINDOW", "month")]), Some(path)).unwrap();

        assert_eq!(config.window, "month");
        assert_eq!(config.format, "parquet");
        assert_eq!(
            config.storage_target(),
            Some(StorageTarget::Local {
                root: PathBuf::from("/var/lib/oce")
            })
        );
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert!(ExporterConfig::load_from(env(&[]), None).is_err());
        assert!(ExporterConfig::load_from(
            env(&[("OCE_SKIP_UPLOAD", "true"), ("OCE_FORMAT", "xlsx")]),
            None
        )
        .is_err());
        assert!(ExporterConfig::load_from(
            env(&[("OCE_SKIP_UPLOAD", "true"), ("OCE_AGGREGATE", " , ")]),
            None
        )
        .is_err());
        assert!(ExporterConfig::load_from(
            env(&[("OCE_STORAGE_ACCOUNT", "costexports")]),
            None
        )
        .is_err());
        assert!(ExporterConfig::load_from(
            env(&[("OCE_SKIP_UPLOAD", "true"), ("OCE_INTERVAL_SECS", "18446744073709551615")]),
            None
        )
        .is_err());
        assert!(ExporterConfig::load_from(
            env(&[("OCE_SKIP_UPLOAD", "true"), ("OCE_INTERVAL_SECS", "31622400")]),
            None
        )
        .is_ok());
    }
}
