//! Fleet manager CLI
//!
//! A command-line tool for inspecting agents, runtimes and instance
//! metrics, and for pushing tasks to a fleet manager.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{agents, metrics, runtimes, status, tasks};

/// Fleet manager CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the Fleet Manager", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and remove agents
    #[command(subcommand)]
    Agents(AgentCommands),

    /// Inspect plugin runtimes
    #[command(subcommand)]
    Runtimes(RuntimeCommands),

    /// View instance resource metrics
    #[command(subcommand)]
    Metrics(MetricCommands),

    /// Queue start and stop tasks
    #[command(subcommand)]
    Tasks(TaskCommands),

    /// Show manager health and readiness
    Status,
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List registered agents
    List,

    /// Unregister an agent and release its instances
    Unregister {
        /// Agent ID
        agent_id: String,
    },
}

#[derive(Subcommand)]
pub enum RuntimeCommands {
    /// List runtimes
    List {
        /// Filter by status (pending, pushed, running, killing)
        #[arg(long)]
        status: Option<String>,

        /// Filter by owning agent
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum MetricCommands {
    /// Show peak CPU and memory per instance
    Peaks,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Push a task to the scheduler queue
    Push {
        /// Instance ID
        instance_id: String,

        /// Instance version
        version: String,

        /// Task action
        #[arg(long, value_enum, default_value = "start")]
        action: tasks::Action,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let client = client::ApiClient::new(&config.api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Agents(cmd) => match cmd {
            AgentCommands::List => agents::list_agents(&client, cli.format).await?,
            AgentCommands::Unregister { agent_id } => {
                agents::unregister_agent(&client, &agent_id, cli.format).await?
            }
        },
        Commands::Runtimes(RuntimeCommands::List { status, agent }) => {
            runtimes::list_runtimes(&client, status, agent, cli.format).await?
        }
        Commands::Metrics(MetricCommands::Peaks) => metrics::show_peaks(&client, cli.format).await?,
        Commands::Tasks(TaskCommands::Push {
            instance_id,
            version,
            action,
        }) => tasks::push_task(&client, &instance_id, &version, action, cli.format).await?,
        Commands::Status => status::show_status(&client, cli.format).await?,
    }

    Ok(())
}
