//! Allocation response flattening
//!
//! Converts the API's `data: [ {<key>: <allocation> | null} ]` tree into
//! typed [`AllocationRecord`]s. Numeric fields are rounded here so every
//! downstream consumer sees the same values.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::ExportError;
use crate::fetcher::AllocationResponse;
use crate::models::{
    AllocationRecord, AllocationWindow, BYTES_PRECISION, COST_PRECISION, RATIO_PRECISION,
    USAGE_PRECISION,
};

/// Source of export timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock UTC time
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Label keys extracted into attribution columns, canonical key first
const TEAM_LABELS: &[&str] = &["team", "label_team"];
const PROJECT_LABELS: &[&str] = &["project", "label_project"];
const ENVIRONMENT_LABELS: &[&str] = &["environment", "env", "label_environment"];
const COST_CENTER_LABELS: &[&str] = &[
    "cost-center",
    "cost_center",
    "costcenter",
    "costCenter",
    "label_cost_center",
];
const APP_LABELS: &[&str] = &["app", "label_app"];

/// Flattens one decoded allocation response
pub struct Flattener<'a> {
    windows: &'a [Value],
    clock: Clock,
}

impl<'a> Flattener<'a> {
    /// Validate the top-level `data` shape
    pub fn new(response: &'a AllocationResponse) -> Result<Self, ExportError> {
        Self::from_data(&response.data)
    }

    pub fn from_data(data: &'a Value) -> Result<Self, ExportError> {
        let windows: &[Value] = match data {
            Value::Array(windows) => windows,
            Value::Null => &[],
            other => {
                return Err(ExportError::Flatten(format!(
                    "expected data to be a list of windows, found {}",
                    type_name(other)
                )))
            }
        };
        Ok(Self {
            windows,
            clock: system_clock(),
        })
    }

    /// Use `clock` for export timestamps instead of the system clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Number of window objects in the response
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// A fresh pass over every non-null allocation
    pub fn records(&self) -> Records<'a> {
        Records {
            windows: self.windows.iter().enumerate(),
            current: None,
            clock: self.clock.clone(),
            failed: false,
        }
    }

    /// Materialize all records, failing on the first malformed entry
    pub fn collect(&self) -> Result<Vec<AllocationRecord>, ExportError> {
        self.records().collect()
    }
}

/// Lazy iterator over flattened records
pub struct Records<'a> {
    windows: std::iter::Enumerate<std::slice::Iter<'a, Value>>,
    current: Option<(usize, serde_json::map::Iter<'a>)>,
    clock: Clock,
    failed: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<AllocationRecord, ExportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((index, entries)) = self.current.as_mut() {
                for (key, value) in entries.by_ref() {
                    match value {
                        // Resource had no allocation in this sub-window
                        Value::Null => continue,
                        Value::Object(allocation) => {
                            return Some(Ok(extract_record(key, allocation, (self.clock)())));
                        }
                        other => {
                            let err = ExportError::Flatten(format!(
                                "allocation '{}' in window {} is {}, expected an object",
                                key,
                                index,
                                type_name(other)
                            ));
                            self.failed = true;
                            return Some(Err(err));
                        }
                    }
                }
                self.current = None;
            }

            let (index, window) = self.windows.next()?;
            match window {
                Value::Object(entries) => self.current = Some((index, entries.iter())),
                other => {
                    self.failed = true;
                    return Some(Err(ExportError::Flatten(format!(
                        "window {} is {}, expected a mapping of allocations",
                        index,
                        type_name(other)
                    ))));
                }
            }
        }
    }
}

/// Build one record; missing or malformed fields become "" or 0
fn extract_record(
    key: &str,
    allocation: &Map<String, Value>,
    exported_at: DateTime<Utc>,
) -> AllocationRecord {
    let empty = Map::new();
    let properties = allocation
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let labels = properties
        .get("labels")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let window = parse_window(allocation.get("window"));

    let name = allocation
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .unwrap_or(key)
        .to_string();

    AllocationRecord {
        window_start: window.start,
        window_end: window.end,
        name,
        cluster: text(properties, "cluster"),
        namespace: text(properties, "namespace"),
        controller_kind: text(properties, "controllerKind"),
        controller: text(properties, "controller"),
        pod: text(properties, "pod"),
        container: text(properties, "container"),
        node: text(properties, "node"),
        team: label(labels, TEAM_LABELS),
        project: label(labels, PROJECT_LABELS),
        environment: label(labels, ENVIRONMENT_LABELS),
        cost_center: label(labels, COST_CENTER_LABELS),
        app: label(labels, APP_LABELS),
        cpu_core_hours: metric(allocation, "cpuCoreHours", USAGE_PRECISION),
        cpu_core_request_average: metric(allocation, "cpuCoreRequestAverage", USAGE_PRECISION),
        cpu_core_usage_average: metric(allocation, "cpuCoreUsageAverage", USAGE_PRECISION),
        ram_byte_hours: metric(allocation, "ramByteHours", USAGE_PRECISION),
        ram_bytes_request_average: metric(allocation, "ramBytesRequestAverage", BYTES_PRECISION),
        ram_bytes_usage_average: metric(allocation, "ramBytesUsageAverage", BYTES_PRECISION),
        cpu_cost: metric(allocation, "cpuCost", COST_PRECISION),
        ram_cost: metric(allocation, "ramCost", COST_PRECISION),
        gpu_cost: metric(allocation, "gpuCost", COST_PRECISION),
        pv_cost: metric(allocation, "pvCost", COST_PRECISION),
        network_cost: metric(allocation, "networkCost", COST_PRECISION),
        load_balancer_cost: metric(allocation, "loadBalancerCost", COST_PRECISION),
        shared_cost: metric(allocation, "sharedCost", COST_PRECISION),
        external_cost: metric(allocation, "externalCost", COST_PRECISION),
        // Passed through as reported; not reconciled against the components
        total_cost: metric(allocation, "totalCost", COST_PRECISION),
        total_efficiency: metric(allocation, "totalEfficiency", RATIO_PRECISION).min(1.0),
        export_timestamp: exported_at,
    }
}

fn parse_window(window: Option<&Value>) -> AllocationWindow {
    let bound = |name: &str| {
        window
            .and_then(|w| w.get(name))
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    };
    AllocationWindow {
        start: bound("start"),
        end: bound("end"),
    }
}

fn text(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn label(labels: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| labels.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Non-negative, finite, rounded value of a numeric field
fn metric(map: &Map<String, Value>, key: &str, places: u32) -> f64 {
    let raw = match map.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        // Some cost model versions encode NaN/Inf and large values as strings
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(v) if v.is_finite() && v > 0.0 => round_to(v, places),
        _ => 0.0,
    }
}

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
