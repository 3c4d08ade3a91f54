use super::{Monitor, MonitorConfig};
use crate::coordination::resources;
use crate::error::ManagerError;
use crate::health::components;
use crate::models::Agent;
use crate::state::SharedState;
use crate::store::Versioned;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Result of one agent-heartbeat pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AgentSweep {
    pub evicted: Vec<String>,
    pub runtimes_removed: usize,
}

pub struct AgentMonitor {
    state: SharedState,
    config: MonitorConfig,
}

impl AgentMonitor {
    pub fn new(state: SharedState, config: MonitorConfig) -> Self {
        Self { state, config }
    }

    pub async fn run_once(&self) -> Result<AgentSweep, ManagerError> {
        let stale = self
            .state
            .agents
            .stale(self.config.agent_heartbeat_timeout)
            .await?;

        let sweep = if stale.is_empty() {
            AgentSweep::default()
        } else {
            let guard = self
                .state
                .coordinator
                .acquire(resources::AGENT_CLEANUP)
                .await?;
            let result = self.evict_all(stale).await;
            guard.release().await;
            result?
        };

        if let Err(e) = self.state.refresh_gauges().await {
            debug!(error = %e, "Failed to refresh fleet gauges");
        }
        Ok(sweep)
    }

    async fn evict_all(&self, stale: Vec<Versioned<Agent>>) -> Result<AgentSweep, ManagerError> {
        let mut sweep = AgentSweep::default();
        for seen in stale {
            let agent_id = seen.value.agent_id.clone();
            // Version check: a report that landed after the snapshot wins
            if !self.state.agents.evict(&seen).await? {
                debug!(agent_id = %agent_id, "Agent reported again, skipping eviction");
                continue;
            }

            let removed = self.state.cascade_agent(&agent_id).await?;
            self.state.metrics.inc_agent_evicted();
            self.state
                .logger
                .log_agent_evicted(&agent_id, seen.value.last_timestamp, removed);
            sweep.runtimes_removed += removed;
            sweep.evicted.push(agent_id);
        }
        Ok(sweep)
    }
}

#[async_trait]
impl Monitor for AgentMonitor {
    fn name(&self) -> &'static str {
        components::AGENT_MONITOR
    }

    fn interval(&self) -> Duration {
        self.config.agent_interval
    }

    fn state(&self) -> &SharedState {
        &self.state
    }

    async fn pass(&self) -> Result<usize, ManagerError> {
        let sweep = self.run_once().await?;
        Ok(sweep.evicted.len())
    }
}
