//! Reconciliation monitors
//!
//! Three independent loops, each taking a fresh snapshot per pass and sleeping
//! a fixed interval between passes:
//! - [`InstanceMonitor`]: times out runtimes whose heartbeat or transition is overdue
//! - [`DesiredStateMonitor`]: diffs the desired set against the registry
//! - [`AgentMonitor`]: evicts agents that stopped reporting, with cascade
//!
//! Monitors only push tasks or CAS-delete records; they never hold a lock
//! across a queue push or an agent call.

mod agent;
mod desired;
mod instance;


pub use agent::{AgentMonitor, AgentSweep};
pub use desired::{DesiredStateMonitor, DesiredSweep};
pub use instance::{InstanceMonitor, InstanceSweep};

use crate::error::ManagerError;
use crate::models::ScheduleTask;
use crate::state::SharedState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timeouts and intervals for the monitors
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Running instance without a heartbeat for this long is stopped (default: 30 seconds)
    pub instance_heartbeat_timeout: Duration,
    /// Pushed instance never confirmed for this long is stopped (default: 60 seconds)
    pub pushed_timeout: Duration,
    /// Pending record whose start never settled is deleted so the instance can be
    /// placed again (default: 60 seconds)
    pub pending_timeout: Duration,
    /// Killing instance never confirmed for this long is deleted (default: 120 seconds)
    pub killing_timeout: Duration,
    /// Agent without a report for this long is evicted (default: 60 seconds)
    pub agent_heartbeat_timeout: Duration,
    pub instance_interval: Duration,
    pub desired_interval: Duration,
    pub agent_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            instance_heartbeat_timeout: Duration::from_secs(30),
            pushed_timeout: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(60),
            killing_timeout: Duration::from_secs(120),
            agent_heartbeat_timeout: Duration::from_secs(60),
            instance_interval: Duration::from_secs(10),
            desired_interval: Duration::from_secs(30),
            agent_interval: Duration::from_secs(10),
        }
    }
}

/// One reconciliation loop
#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    /// Health component name
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn state(&self) -> &SharedState;

    /// Run a single pass; returns how many corrective actions it took
    async fn pass(&self) -> Result<usize, ManagerError>;
}

/// Run `monitor` until shutdown
pub async fn run_monitor(monitor: Arc<dyn Monitor>, mut shutdown: broadcast::Receiver<()>) {
    let name = monitor.name();
    info!(
        monitor = name,
        interval_secs = monitor.interval().as_secs(),
        "Starting monitor"
    );

    let mut ticker = interval(monitor.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let state = monitor.state().clone();
    state.health.set_healthy(name).await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match monitor.pass().await {
                    Ok(actions) => {
                        state.store_health.record_success().await;
                        state.health.set_healthy(name).await;
                        if actions > 0 {
                            debug!(monitor = name, actions = actions, "Monitor pass complete");
                        }
                    }
                    Err(e) => {
                        if let Some(store_err) = e.store_unavailable() {
                            state.store_health.record_failure(&store_err.to_string()).await;
                        }
                        warn!(monitor = name, error = %e, "Monitor pass failed");
                        state.health.set_degraded(name, e.to_string()).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(monitor = name, "Shutting down monitor");
                break;
            }
        }
    }
}

/// Push a corrective task; a full queue only skips it until the next pass
async fn push_corrective(state: &SharedState, task: ScheduleTask) -> bool {
    match state.tasks.push(task.clone()).await {
        Ok(()) => {
            state.metrics.inc_task_pushed(&task);
            true
        }
        Err(e) => {
            warn!(
                instance = %task.key(),
                action = %task.action,
                error = %e,
                "Failed to push corrective task"
            );
            false
        }
    }
}
