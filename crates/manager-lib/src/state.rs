//! Handles shared by the manager facade, the scheduler and the monitors

use crate::agent_client::AgentCommander;
use crate::clock::Clock;
use crate::coordination::Coordinator;
use crate::error::StoreError;
use crate::health::{HealthRegistry, StoreHealth};
use crate::observability::{ManagerMetrics, StructuredLogger};
use crate::registry::{AgentRegistry, MetricStore, RuntimeRegistry};
use crate::scheduler::TaskSender;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SharedState {
    pub agents: Arc<AgentRegistry>,
    pub runtimes: RuntimeRegistry,
    pub metric_store: Arc<MetricStore>,
    pub coordinator: Arc<dyn Coordinator>,
    pub commander: Arc<dyn AgentCommander>,
    pub clock: Arc<dyn Clock>,
    pub tasks: TaskSender,
    pub metrics: ManagerMetrics,
    pub logger: StructuredLogger,
    pub health: HealthRegistry,
    pub store_health: Arc<StoreHealth>,
    /// Bound on read-modify-CAS retries
    pub cas_attempts: usize,
}

impl SharedState {
    /// Feed a store result into the `store` health component and pass it on
    pub async fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match &result {
            Ok(_) => self.store_health.record_success().await,
            Err(e) if e.is_unavailable() => self.store_health.record_failure(&e.to_string()).await,
            Err(_) => {}
        }
        result
    }

    /// Delete every runtime placed on `agent_id` and the agent's metric.
    /// Returns the number of runtime records removed.
    pub async fn cascade_agent(&self, agent_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for _ in 0..self.cas_attempts.max(1) {
            let owned = self.runtimes.owned_by(agent_id).await?;
            if owned.is_empty() {
                break;
            }
            for runtime in &owned {
                if self.runtimes.delete(runtime).await? {
                    removed += 1;
                } else {
                    self.metrics.inc_cas_conflict();
                    debug!(
                        agent_id = %agent_id,
                        instance = %runtime.key(),
                        "Runtime changed during cascade, re-reading"
                    );
                }
            }
        }

        self.metric_store.remove_agent(agent_id).await?;
        self.commander.forget(agent_id);
        self.metrics.add_instances_evicted(removed as u64);
        Ok(removed)
    }

    /// Refresh fleet-size gauges from the registries
    pub async fn refresh_gauges(&self) -> Result<(), StoreError> {
        self.metrics.set_agents(self.agents.len().await?);
        self.metrics
            .set_runtimes(&self.runtimes.count_by_status().await?);
        self.metrics.set_queue_depth(self.tasks.depth());
        Ok(())
    }
}
