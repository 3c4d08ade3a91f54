//! Agent commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{Agent, ApiClient};
use crate::output::{
    format_cpu, format_millis, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for agents table
#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "Agent")]
    agent_id: String,
    #[tabled(rename = "Address")]
    agent_ip: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Instances")]
    instances: usize,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl From<&Agent> for AgentRow {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            agent_ip: agent.agent_ip.clone(),
            cpu: format_cpu(agent.metric.usage_cpu),
            memory: format!("{:.1}", agent.metric.usage_memory),
            instances: agent.running_instances.len(),
            last_seen: format_millis(agent.last_timestamp),
        }
    }
}

/// List registered agents
pub async fn list_agents(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let agents: Vec<Agent> = client.get("api/v1/agents").await?;

    match format {
        OutputFormat::Json => print_json(&agents)?,
        OutputFormat::Table => {
            let rows: Vec<AgentRow> = agents.iter().map(AgentRow::from).collect();
            print_table(&rows, "No agents registered");
        }
    }
    Ok(())
}

/// Unregister an agent; its instances are removed from the fleet
pub async fn unregister_agent(client: &ApiClient, agent_id: &str, format: OutputFormat) -> Result<()> {
    let path = format!("api/v1/agents/{}", agent_id);
    let agent: Agent = match client.delete(&path).await {
        Ok(agent) => agent,
        Err(e) if e.is_not_found() => {
            print_warning(&format!("Agent {} is not registered", agent_id));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => print_json(&agent)?,
        OutputFormat::Table => print_success(&format!(
            "Unregistered agent {} ({} instances released)",
            agent.agent_id,
            agent.running_instances.len()
        )),
    }
    Ok(())
}
