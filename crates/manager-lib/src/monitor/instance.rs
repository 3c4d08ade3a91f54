use super::{push_corrective, Monitor, MonitorConfig};
use crate::clock::elapsed_since;
use crate::error::ManagerError;
use crate::health::components;
use crate::models::{InstanceKey, RuntimeStatus, ScheduleTask};
use crate::state::SharedState;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Result of one instance-heartbeat pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstanceSweep {
    /// Stop tasks pushed for overdue running or pushed instances
    pub stopped: Vec<InstanceKey>,
    /// Stale pending and killing records deleted
    pub removed: Vec<InstanceKey>,
}

pub struct InstanceMonitor {
    state: SharedState,
    config: MonitorConfig,
}

impl InstanceMonitor {
    pub fn new(state: SharedState, config: MonitorConfig) -> Self {
        Self { state, config }
    }

    pub async fn run_once(&self) -> Result<InstanceSweep, ManagerError> {
        let mut sweep = InstanceSweep::default();
        let mut range = self.state.runtimes.range().await?;

        while let Some(runtime) = range.next().await? {
            let age = elapsed_since(self.state.clock.as_ref(), runtime.last_timestamp);
            let key = runtime.key();

            match runtime.status {
                RuntimeStatus::Running if age > self.config.instance_heartbeat_timeout => {
                    info!(
                        instance = %key,
                        agent_id = %runtime.agent_id,
                        age_secs = age.as_secs(),
                        "Instance heartbeat missed, stopping"
                    );
                    if push_corrective(&self.state, ScheduleTask::stop(&key)).await {
                        sweep.stopped.push(key);
                    }
                }
                RuntimeStatus::Pushed if age > self.config.pushed_timeout => {
                    info!(
                        instance = %key,
                        agent_id = %runtime.agent_id,
                        age_secs = age.as_secs(),
                        "Pushed instance never confirmed, stopping"
                    );
                    if push_corrective(&self.state, ScheduleTask::stop(&key)).await {
                        sweep.stopped.push(key);
                    }
                }
                // Start never settled: the rollback failed or its replica went away
                RuntimeStatus::Pending if age > self.config.pending_timeout => {
                    if self.state.runtimes.delete(&runtime).await? {
                        info!(
                            instance = %key,
                            agent_id = %runtime.agent_id,
                            age_secs = age.as_secs(),
                            "Pending placement abandoned, removing record"
                        );
                        sweep.removed.push(key);
                    } else {
                        self.state.metrics.inc_cas_conflict();
                    }
                }
                RuntimeStatus::Killing if age > self.config.killing_timeout => {
                    if self.state.runtimes.delete(&runtime).await? {
                        info!(
                            instance = %key,
                            agent_id = %runtime.agent_id,
                            "Stop never confirmed, removing record"
                        );
                        self.state.metrics.add_instances_evicted(1);
                        sweep.removed.push(key);
                    } else {
                        self.state.metrics.inc_cas_conflict();
                    }
                }
                _ => {}
            }
        }

        Ok(sweep)
    }
}

#[async_trait]
impl Monitor for InstanceMonitor {
    fn name(&self) -> &'static str {
        components::INSTANCE_MONITOR
    }

    fn interval(&self) -> Duration {
        self.config.instance_interval
    }

    fn state(&self) -> &SharedState {
        &self.state
    }

    async fn pass(&self) -> Result<usize, ManagerError> {
        let sweep = self.run_once().await?;
        Ok(sweep.stopped.len() + sweep.removed.len())
    }
}
