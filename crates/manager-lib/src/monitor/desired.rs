use super::{push_corrective, Monitor, MonitorConfig};
use crate::desired_state::DesiredStateSource;
use crate::error::ManagerError;
use crate::health::components;
use crate::models::{InstanceKey, RuntimeStatus, ScheduleTask};
use crate::state::SharedState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Result of one desired-state pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DesiredSweep {
    pub started: Vec<InstanceKey>,
    pub stopped: Vec<InstanceKey>,
}

pub struct DesiredStateMonitor {
    state: SharedState,
    source: Arc<dyn DesiredStateSource>,
    config: MonitorConfig,
}

impl DesiredStateMonitor {
    pub fn new(
        state: SharedState,
        source: Arc<dyn DesiredStateSource>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            state,
            source,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<DesiredSweep, ManagerError> {
        let desired = self
            .source
            .desired()
            .await
            .map_err(|e| ManagerError::DesiredState(format!("{:#}", e)))?;
        let current: HashMap<InstanceKey, RuntimeStatus> = self
            .state
            .runtimes
            .list()
            .await?
            .into_iter()
            .map(|r| (r.key(), r.status))
            .collect();

        let mut sweep = DesiredSweep::default();

        // BTreeSet iteration keeps task order stable
        for key in desired.iter().filter(|k| !current.contains_key(*k)) {
            if push_corrective(&self.state, ScheduleTask::start(key)).await {
                sweep.started.push(key.clone());
            }
        }

        let mut extra: Vec<&InstanceKey> = current
            .iter()
            .filter(|(key, status)| !desired.contains(*key) && **status != RuntimeStatus::Killing)
            .map(|(key, _)| key)
            .collect();
        extra.sort();
        for key in extra {
            if push_corrective(&self.state, ScheduleTask::stop(key)).await {
                sweep.stopped.push(key.clone());
            }
        }

        if !sweep.started.is_empty() || !sweep.stopped.is_empty() {
            info!(
                started = sweep.started.len(),
                stopped = sweep.stopped.len(),
                "Reconciled desired state"
            );
        }
        Ok(sweep)
    }
}

#[async_trait]
impl Monitor for DesiredStateMonitor {
    fn name(&self) -> &'static str {
        components::DESIRED_MONITOR
    }

    fn interval(&self) -> Duration {
        self.config.desired_interval
    }

    fn state(&self) -> &SharedState {
        &self.state
    }

    async fn pass(&self) -> Result<usize, ManagerError> {
        let sweep = self.run_once().await?;
        Ok(sweep.started.len() + sweep.stopped.len())
    }
}
