//! Core data models for allocation exports

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ExportError;

/// Column order of every tabular artifact
pub const CSV_HEADER: [&str; 32] = [
    "WindowStart",
    "WindowEnd",
    "Name",
    "Cluster",
    "Namespace",
    "ControllerKind",
    "Controller",
    "Pod",
    "Container",
    "Node",
    "Team",
    "Project",
    "Environment",
    "CostCenter",
    "App",
    "CPUCoreHours",
    "CPUCoreRequestAverage",
    "CPUCoreUsageAverage",
    "RAMByteHours",
    "RAMBytesRequestAverage",
    "RAMBytesUsageAverage",
    "CPUCost",
    "RAMCost",
    "GPUCost",
    "PVCost",
    "NetworkCost",
    "LoadBalancerCost",
    "SharedCost",
    "ExternalCost",
    "TotalCost",
    "TotalEfficiency",
    "ExportTimestamp",
];

/// Decimal places kept for CPU figures and byte-hours
pub const USAGE_PRECISION: u32 = 6;
/// Decimal places kept for byte quantities
pub const BYTES_PRECISION: u32 = 2;
/// Decimal places kept for cost figures
pub const COST_PRECISION: u32 = 6;
/// Decimal places kept for ratios
pub const RATIO_PRECISION: u32 = 4;

/// Time interval an allocation was aggregated over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// One flattened allocation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    #[serde(rename = "WindowStart", with = "optional_timestamp")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(rename = "WindowEnd", with = "optional_timestamp")]
    pub window_end: Option<DateTime<Utc>>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "ControllerKind")]
    pub controller_kind: String,
    #[serde(rename = "Controller")]
    pub controller: String,
    #[serde(rename = "Pod")]
    pub pod: String,
    #[serde(rename = "Container")]
    pub container: String,
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Team")]
    pub team: String,
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "Environment")]
    pub environment: String,
    #[serde(rename = "CostCenter")]
    pub cost_center: String,
    #[serde(rename = "App")]
    pub app: String,
    #[serde(rename = "CPUCoreHours")]
    pub cpu_core_hours: f64,
    #[serde(rename = "CPUCoreRequestAverage")]
    pub cpu_core_request_average: f64,
    #[serde(rename = "CPUCoreUsageAverage")]
    pub cpu_core_usage_average: f64,
    #[serde(rename = "RAMByteHours")]
    pub ram_byte_hours: f64,
    #[serde(rename = "RAMBytesRequestAverage")]
    pub ram_bytes_request_average: f64,
    #[serde(rename = "RAMBytesUsageAverage")]
    pub ram_bytes_usage_average: f64,
    #[serde(rename = "CPUCost")]
    pub cpu_cost: f64,
    #[serde(rename = "RAMCost")]
    pub ram_cost: f64,
    #[serde(rename = "GPUCost")]
    pub gpu_cost: f64,
    #[serde(rename = "PVCost")]
    pub pv_cost: f64,
    #[serde(rename = "NetworkCost")]
    pub network_cost: f64,
    #[serde(rename = "LoadBalancerCost")]
    pub load_balancer_cost: f64,
    #[serde(rename = "SharedCost")]
    pub shared_cost: f64,
    #[serde(rename = "ExternalCost")]
    pub external_cost: f64,
    #[serde(rename = "TotalCost")]
    pub total_cost: f64,
    #[serde(rename = "TotalEfficiency")]
    pub total_efficiency: f64,
    #[serde(rename = "ExportTimestamp", with = "timestamp")]
    pub export_timestamp: DateTime<Utc>,
}

impl AllocationRecord {
    /// Window the record was aggregated over
    pub fn window(&self) -> AllocationWindow {
        AllocationWindow {
            start: self.window_start,
            end: self.window_end,
        }
    }
}

/// Render a timestamp the way artifacts carry it (RFC 3339, second precision)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// Unknown window bounds travel as empty strings, never null
mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&super::format_timestamp(ts)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(D::Error::custom)
    }
}

/// Artifact encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Delimited text with a header row
    #[default]
    Csv,
    /// Pretty-printed array of objects
    Json,
    /// Compressed columnar table
    Parquet,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Parquet => "parquet",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
            ExportFormat::Parquet => "application/vnd.apache.parquet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            "parquet" => Ok(ExportFormat::Parquet),
            other => Err(ExportError::Config(format!(
                "unknown output format '{}' (expected csv, json or parquet)",
                other
            ))),
        }
    }
}

/// Pipeline stage of an export run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetching,
    Flattening,
    Writing,
    Publishing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Flattening => "flattening",
            Stage::Writing => "writing",
            Stage::Publishing => "publishing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(Stage),
    Succeeded,
    Failed { stage: Stage, cause: String },
}

impl RunState {
    /// Move to `stage`, which must directly follow the current state
    pub fn enter(&mut self, stage: Stage) -> Result<(), ExportError> {
        let allowed = matches!(
            (&*self, stage),
            (RunState::Idle, Stage::Fetching)
                | (RunState::Running(Stage::Fetching), Stage::Flattening)
                | (RunState::Running(Stage::Flattening), Stage::Writing)
                | (RunState::Running(Stage::Writing), Stage::Publishing)
        );
        if !allowed {
            return Err(ExportError::Config(format!(
                "illegal run transition {:?} -> {}",
                self, stage
            )));
        }
        *self = RunState::Running(stage);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed { .. })
    }
}

/// Final result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed {
        stage: Stage,
        kind: String,
        cause: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// Description of the artifact a run produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub filename: String,
    pub size_bytes: usize,
    pub sha256: String,
}

/// Attempts spent in the two network stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    pub fetch: u32,
    pub publish: u32,
}

/// Record of one export execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRun {
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub window: String,
    pub aggregate: Vec<String>,
    pub format: ExportFormat,
    pub record_count: usize,
    /// Blob location or local path of the artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSummary>,
    pub attempts: StageAttempts,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExportRun {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_round_trip_through_str() {
        for format in [ExportFormat::Csv, ExportFormat::Json, ExportFormat::Parquet] {
            let parsed: ExportFormat = format.to_string().parse().unwrap();
            assert_eq!(parsed, format);
        }
        assert_eq!("PARQUET".parse::<ExportFormat>().unwrap(), ExportFormat::Parquet);
        assert!("xlsx".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_run_state_is_strictly_sequential() {
        let mut state = RunState::Idle;
        assert!(state.enter(Stage::Flattening).is_err());

        state.enter(Stage::Fetching).unwrap();
        state.enter(Stage::Flattening).unwrap();
        assert!(state.enter(Stage::Publishing).is_err());
        state.enter(Stage::Writing).unwrap();
        state.enter(Stage::Publishing).unwrap();
        assert_eq!(state, RunState::Running(Stage::Publishing));
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_header_matches_serialized_field_names() {
        let record = AllocationRecord {
            window_start: None,
            window_end: None,
            name: "a".into(),
            cluster: String::new(),
            namespace: String::new(),
            controller_kind: String::new(),
            controller: String::new(),
            pod: String::new(),
            container: String::new(),
            node: String::new(),
            team: String::new(),
            project: String::new(),
            environment: String::new(),
            cost_center: String::new(),
            app: String::new(),
            cpu_core_hours: 0.0,
            cpu_core_request_average: 0.0,
            cpu_core_usage_average: 0.0,
            ram_byte_hours: 0.0,
            ram_bytes_request_average: 0.0,
            ram_bytes_usage_average: 0.0,
            cpu_cost: 0.0,
            ram_cost: 0.0,
            gpu_cost: 0.0,
            pv_cost: 0.0,
            network_cost: 0.0,
            load_balancer_cost: 0.0,
            shared_cost: 0.0,
            external_cost: 0.0,
            total_cost: 0.0,
            total_efficiency: 0.0,
            export_timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };

        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), CSV_HEADER.len());
        for column in CSV_HEADER {
            assert!(object.contains_key(column), "missing {}", column);
        }
        assert_eq!(object["WindowStart"], "");
        assert_eq!(object["ExportTimestamp"], "2024-01-02T03:04:05Z");
    }
}
