//! Instance metric commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, InstancePeak};
use crate::output::{format_cpu, format_millis, print_json, print_table, OutputFormat};

/// Row for peaks table
#[derive(Tabled)]
struct PeakRow {
    #[tabled(rename = "Instance")]
    instance_id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Peak CPU")]
    cpu: String,
    #[tabled(rename = "At")]
    cpu_time: String,
    #[tabled(rename = "Peak Memory")]
    memory: String,
    #[tabled(rename = "At")]
    memory_time: String,
}

/// Show peak CPU and memory per instance
pub async fn show_peaks(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let peaks: Vec<InstancePeak> = client.get("api/v1/metrics/instances").await?;

    match format {
        OutputFormat::Json => print_json(&peaks)?,
        OutputFormat::Table => {
            let rows: Vec<PeakRow> = peaks
                .iter()
                .map(|p| PeakRow {
                    instance_id: p.instance_id.clone(),
                    version: p.version.clone(),
                    cpu: format_cpu(p.cpu),
                    cpu_time: format_millis(p.cpu_time),
                    memory: format!("{:.1}", p.memory),
                    memory_time: format_millis(p.memory_time),
                })
                .collect();
            print_table(&rows, "No instance metrics recorded");
        }
    }
    Ok(())
}
