//! Task commands

use anyhow::Result;
use clap::ValueEnum;

use crate::client::{ApiClient, ScheduledTask, TaskRequest};
use crate::output::{print_json, print_success, OutputFormat};

/// Action of a pushed task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Action {
    #[default]
    Start,
    Stop,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }
}

/// Push a start or stop task to the scheduler queue
pub async fn push_task(
    client: &ApiClient,
    instance_id: &str,
    version: &str,
    action: Action,
    format: OutputFormat,
) -> Result<()> {
    let request = TaskRequest {
        instance_id: instance_id.to_string(),
        version: version.to_string(),
        action: action.as_str().to_string(),
    };
    let task: ScheduledTask = client.post("api/v1/tasks", &request).await?;

    match format {
        OutputFormat::Json => print_json(&task)?,
        OutputFormat::Table => print_success(&format!(
            "Queued {} of {}@{}",
            task.action, task.instance_id, task.version
        )),
    }
    Ok(())
}
