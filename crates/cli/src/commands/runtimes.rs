//! Plugin runtime commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, PluginRuntime};
use crate::output::{color_status, format_millis, print_json, print_table, OutputFormat};

/// Row for runtimes table
#[derive(Tabled)]
struct RuntimeRow {
    #[tabled(rename = "Instance")]
    instance_id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Agent")]
    agent_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// List plugin runtimes, optionally filtered by status and agent
pub async fn list_runtimes(
    client: &ApiClient,
    status: Option<String>,
    agent: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut query = Vec::new();
    if let Some(status) = status {
        query.push(("status", status.to_lowercase()));
    }
    if let Some(agent) = agent {
        query.push(("agent", agent));
    }
    let runtimes: Vec<PluginRuntime> = client.get_with_query("api/v1/runtimes", &query).await?;

    match format {
        OutputFormat::Json => print_json(&runtimes)?,
        OutputFormat::Table => {
            let rows: Vec<RuntimeRow> = runtimes
                .iter()
                .map(|r| RuntimeRow {
                    instance_id: r.instance_id.clone(),
                    version: r.version.clone(),
                    status: color_status(&r.status),
                    agent_id: if r.agent_id.is_empty() {
                        "-".to_string()
                    } else {
                        r.agent_id.clone()
                    },
                    updated: format_millis(r.last_timestamp),
                })
                .collect();
            print_table(&rows, "No runtimes found");
        }
    }
    Ok(())
}
