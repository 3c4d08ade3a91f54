//! Manager facade
//!
//! Wires the registries, the scheduler and the monitors together and exposes
//! the inbound operations: register, unregister, report and push task.

mod report;


use crate::agent_client::{AgentClientConfig, AgentCommander, GrpcAgentClient};
use crate::clock::{Clock, SystemClock};
use crate::coordination::{resources, Coordinator, KvCoordinator, LeaseConfig, LocalCoordinator};
use crate::desired_state::DesiredStateSource;
use crate::error::{ManagerError, Result};
use crate::health::{components, HealthRegistry, StoreHealth};
use crate::models::{Agent, InstanceKey, PluginMetric, PluginRuntime, ScheduleTask};
use crate::monitor::{
    run_monitor, AgentMonitor, DesiredStateMonitor, InstanceMonitor, Monitor, MonitorConfig,
};
use crate::observability::{ManagerMetrics, StructuredLogger};
use crate::registry::{AgentRegistry, MetricStore, RuntimeRegistry};
use crate::scheduler::{task_queue, Scheduler, SchedulerConfig, TaskReceiver};
use crate::state::SharedState;
use crate::store::{KvStore, StorageBackend};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What to do when a report claims an instance another agent owns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipPolicy {
    /// Keep the current owner
    #[default]
    Reject,
    /// Move the record to the reporting agent
    Reassign,
    /// Move the record and tell the previous owner to stop its copy
    EvictStale,
}

impl OwnershipPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipPolicy::Reject => "reject",
            OwnershipPolicy::Reassign => "reassign",
            OwnershipPolicy::EvictStale => "evict_stale",
        }
    }
}

impl fmt::Display for OwnershipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnershipPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reject" => Ok(OwnershipPolicy::Reject),
            "reassign" => Ok(OwnershipPolicy::Reassign),
            "evict_stale" | "evict-stale" => Ok(OwnershipPolicy::EvictStale),
            other => Err(format!("unknown ownership policy: {}", other)),
        }
    }
}

/// Configuration for a manager replica
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Identity of this replica; owner name of its distributed leases
    pub manager_id: String,
    pub scheduler: SchedulerConfig,
    pub monitors: MonitorConfig,
    pub ownership_policy: OwnershipPolicy,
    /// Consecutive store failures before `/readyz` fails (default: 3)
    pub store_failure_threshold: u32,
    /// Bound on each shared-store call (default: 3 seconds)
    pub store_timeout: Duration,
    /// Bound on acquiring a named lock (default: 5 seconds)
    pub lock_timeout: Duration,
    /// Lifetime of a distributed lease (default: 15 seconds)
    pub lease_ttl: Duration,
    /// Bound on read-modify-CAS retries (default: 16)
    pub cas_attempts: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_id: "manager-0".to_string(),
            scheduler: SchedulerConfig::default(),
            monitors: MonitorConfig::default(),
            ownership_policy: OwnershipPolicy::Reject,
            store_failure_threshold: 3,
            store_timeout: Duration::from_secs(3),
            lock_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(15),
            cas_attempts: 16,
        }
    }
}

/// Builder for [`Manager`]
pub struct ManagerBuilder {
    config: ManagerConfig,
    kv: Option<Arc<dyn KvStore>>,
    commander: Option<Arc<dyn AgentCommander>>,
    clock: Option<Arc<dyn Clock>>,
    desired: Option<Arc<dyn DesiredStateSource>>,
    health: Option<HealthRegistry>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerBuilder {
    /// Create a new builder with default configuration and in-memory storage
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            kv: None,
            commander: None,
            clock: None,
            desired: None,
            health: None,
        }
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Keep state in a shared key-value store instead of process memory
    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Set the agent commander (default: gRPC client)
    pub fn commander(mut self, commander: Arc<dyn AgentCommander>) -> Self {
        self.commander = Some(commander);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the desired-state feed. Without one the desired-state monitor does not run.
    pub fn desired_state(mut self, source: Arc<dyn DesiredStateSource>) -> Self {
        self.desired = Some(source);
        self
    }

    /// Share a health registry with the HTTP layer
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Manager {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (backend, coordinator): (StorageBackend, Arc<dyn Coordinator>) = match self.kv {
            Some(kv) => (
                StorageBackend::Kv {
                    store: kv.clone(),
                    timeout: config.store_timeout,
                },
                Arc::new(KvCoordinator::new(
                    kv,
                    config.manager_id.clone(),
                    clock.clone(),
                    LeaseConfig {
                        ttl: config.lease_ttl,
                        acquire_timeout: config.lock_timeout,
                        op_timeout: config.store_timeout,
                        ..Default::default()
                    },
                )),
            ),
            None => (
                StorageBackend::Memory,
                Arc::new(LocalCoordinator::new(config.lock_timeout)),
            ),
        };

        let commander = self
            .commander
            .unwrap_or_else(|| Arc::new(GrpcAgentClient::new(AgentClientConfig::default())));
        let health = self.health.unwrap_or_default();

        let (tasks, receiver) = task_queue(
            config.scheduler.queue_capacity,
            config.scheduler.push_timeout,
        );

        let state = SharedState {
            agents: Arc::new(AgentRegistry::new(&backend, clock.clone(), config.cas_attempts)),
            runtimes: RuntimeRegistry::new(&backend),
            metric_store: Arc::new(MetricStore::new(&backend, config.cas_attempts)),
            coordinator,
            commander,
            clock,
            tasks,
            metrics: ManagerMetrics::new(),
            logger: StructuredLogger::new(config.manager_id.clone()),
            store_health: Arc::new(StoreHealth::new(
                health.clone(),
                config.store_failure_threshold,
            )),
            health,
            cas_attempts: config.cas_attempts,
        };

        let scheduler = Arc::new(Scheduler::new(state.clone(), config.scheduler.clone()));

        Manager {
            state,
            scheduler,
            receiver: Mutex::new(Some(receiver)),
            desired: self.desired,
            backend_name: backend.name(),
            config,
        }
    }
}

/// One manager replica
pub struct Manager {
    state: SharedState,
    config: ManagerConfig,
    scheduler: Arc<Scheduler>,
    receiver: Mutex<Option<TaskReceiver>>,
    desired: Option<Arc<dyn DesiredStateSource>>,
    backend_name: &'static str,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.state.health
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.state.metrics
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.state.logger
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn instance_monitor(&self) -> InstanceMonitor {
        InstanceMonitor::new(self.state.clone(), self.config.monitors.clone())
    }

    /// Monitor for the configured desired-state feed, if there is one
    pub fn desired_state_monitor(&self) -> Option<DesiredStateMonitor> {
        self.desired.as_ref().map(|source| {
            DesiredStateMonitor::new(
                self.state.clone(),
                source.clone(),
                self.config.monitors.clone(),
            )
        })
    }

    pub fn agent_monitor(&self) -> AgentMonitor {
        AgentMonitor::new(self.state.clone(), self.config.monitors.clone())
    }

    /// Register every health component and report ready
    pub async fn mark_ready(&self) {
        for name in components::ALL {
            if name == components::DESIRED_MONITOR && self.desired.is_none() {
                continue;
            }
            if self.state.health.status_of(name).await.is_none() {
                self.state.health.register(name).await;
            }
        }
        self.state.health.set_ready(true).await;
    }

    /// Spawn the scheduler and the monitors.
    ///
    /// The task queue has a single consumer, so only the first call spawns the
    /// scheduler.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.mark_ready().await;
        let mut handles = Vec::new();

        let receiver = match self.receiver.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match receiver {
            Some(receiver) => {
                let scheduler = self.scheduler.clone();
                handles.push(tokio::spawn(scheduler.run(receiver, shutdown.subscribe())));
            }
            None => warn!("Scheduler already running"),
        }

        let mut monitors: Vec<Arc<dyn Monitor>> = vec![
            Arc::new(self.instance_monitor()),
            Arc::new(self.agent_monitor()),
        ];
        if let Some(desired) = self.desired_state_monitor() {
            monitors.push(Arc::new(desired));
        }
        for monitor in monitors {
            handles.push(tokio::spawn(run_monitor(monitor, shutdown.subscribe())));
        }

        info!(
            manager = %self.config.manager_id,
            backend = self.backend_name,
            ownership_policy = %self.config.ownership_policy,
            "Manager started"
        );
        handles
    }

    /// Pass a result through store health tracking
    async fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.state.store_health.record_success().await,
            Err(e) => {
                if let Some(store_err) = e.store_unavailable() {
                    self.state
                        .store_health
                        .record_failure(&store_err.to_string())
                        .await;
                }
            }
        }
        result
    }

    pub async fn register_agent(&self, agent_id: &str, agent_ip: &str) -> Result<Agent> {
        if agent_id.is_empty() {
            return Err(ManagerError::InvalidRequest("agent_id is required".into()));
        }
        let result = self
            .state
            .agents
            .register(agent_id, agent_ip)
            .await
            .map_err(ManagerError::from);
        self.observe(result).await
    }

    /// Remove an agent, block its later reports and clear everything placed on it
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let result = self.unregister_locked(agent_id).await;
        self.observe(result).await
    }

    async fn unregister_locked(&self, agent_id: &str) -> Result<Option<Agent>> {
        let guard = self
            .state
            .coordinator
            .acquire(&resources::agent(agent_id))
            .await?;

        let result: Result<Option<Agent>> = async {
            let removed = self.state.agents.unregister(agent_id).await?;
            let runtimes = self.state.cascade_agent(agent_id).await?;
            info!(agent_id = %agent_id, runtimes_removed = runtimes, "Agent cleanup complete");
            Ok(removed)
        }
        .await;

        guard.release().await;
        result
    }

    /// Enqueue a start or stop intent
    pub async fn push_task(&self, task: ScheduleTask) -> Result<()> {
        if task.instance_id.is_empty() || task.version.is_empty() {
            return Err(ManagerError::InvalidRequest(
                "instance_id and version are required".into(),
            ));
        }
        self.state.tasks.push(task.clone()).await?;
        self.state.metrics.inc_task_pushed(&task);
        Ok(())
    }

    pub async fn agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let result = self.state.agents.get(agent_id).await.map_err(ManagerError::from);
        self.observe(result).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let result = self.state.agents.list().await.map_err(ManagerError::from);
        self.observe(result).await
    }

    pub async fn list_runtimes(&self) -> Result<Vec<PluginRuntime>> {
        let result = self.state.runtimes.list().await.map_err(ManagerError::from);
        self.observe(result).await
    }

    pub async fn runtime(&self, key: &InstanceKey) -> Result<Option<PluginRuntime>> {
        let result = self.state.runtimes.get(key).await.map_err(ManagerError::from);
        self.observe(result).await
    }

    pub async fn instance_metrics(&self) -> Result<Vec<(InstanceKey, PluginMetric)>> {
        let result = self
            .state
            .metric_store
            .list_instance_metrics()
            .await
            .map_err(ManagerError::from);
        self.observe(result).await
    }

    /// Tasks waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.state.tasks.depth()
    }
}
