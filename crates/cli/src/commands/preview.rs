//! `oce preview`: fetch and flatten without producing an artifact

use anyhow::{Context, Result};
use colored::Colorize;
use export_lib::fetcher::{AllocationClient, AllocationSource, ClientConfig};
use export_lib::flatten::Flattener;
use export_lib::AllocationRecord;
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;

use crate::output::{color_efficiency, format_cost, print_info, print_json, print_table, OutputFormat};
use crate::PreviewArgs;

#[derive(Tabled, Serialize)]
struct AllocationRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Team")]
    team: String,
    #[tabled(rename = "Window Start")]
    window_start: String,
    #[tabled(rename = "CPU Cost")]
    cpu_cost: String,
    #[tabled(rename = "RAM Cost")]
    ram_cost: String,
    #[tabled(rename = "Total Cost")]
    total_cost: String,
    #[tabled(rename = "Efficiency")]
    efficiency: String,
}

impl From<&AllocationRecord> for AllocationRow {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            name: record.name.clone(),
            namespace: record.namespace.clone(),
            team: record.team.clone(),
            window_start: record
                .window_start
                .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
            cpu_cost: format_cost(record.cpu_cost),
            ram_cost: format_cost(record.ram_cost),
            total_cost: format_cost(record.total_cost),
            efficiency: color_efficiency(record.total_efficiency),
        }
    }
}

/// Print the records an export with these parameters would contain
pub async fn preview(api_url: &str, args: PreviewArgs, output: OutputFormat) -> Result<()> {
    let client = AllocationClient::new(ClientConfig {
        base_url: api_url.to_string(),
        timeout: Duration::from_secs(args.query.timeout_secs),
        ..ClientConfig::default()
    })
    .context("Failed to create allocation client")?;

    let query = args.query.to_query();
    let response = client
        .fetch(&query)
        .await
        .with_context(|| format!("Fetching allocations from {} failed", client.endpoint()))?;
    let records = Flattener::new(&response)
        .and_then(|flattener| flattener.collect())
        .context("Allocation response could not be flattened")?;

    let total = records.len();
    let shown = if args.limit == 0 {
        &records[..]
    } else {
        &records[..total.min(args.limit)]
    };

    match output {
        OutputFormat::Json => print_json(shown),
        OutputFormat::Table => {
            let rows: Vec<AllocationRow> = shown.iter().map(AllocationRow::from).collect();
            print_table(&rows, output);

            let total_cost: f64 = records.iter().map(|r| r.total_cost).sum();
            println!(
                "{} {} across {} allocations",
                "Total cost:".bold(),
                format_cost(total_cost),
                total
            );
            if shown.len() < total {
                print_info(&format!(
                    "Showing {} of {} records; pass --limit 0 to show all",
                    shown.len(),
                    total
                ));
            }
        }
    }

    Ok(())
}
