//! Latest agent metrics and peak instance usage

use super::prefixes;
use crate::error::StoreError;
use crate::models::{AgentMetric, InstanceKey, PluginMetric};
use crate::store::{remove_record, update_record, RecordStore, StorageBackend};
use std::sync::Arc;

pub struct MetricStore {
    agents: Arc<dyn RecordStore<AgentMetric>>,
    instances: Arc<dyn RecordStore<PluginMetric>>,
    cas_attempts: usize,
}

impl MetricStore {
    pub fn new(backend: &StorageBackend, cas_attempts: usize) -> Self {
        Self {
            agents: backend.open(prefixes::AGENT_METRICS),
            instances: backend.open(prefixes::INSTANCE_METRICS),
            cas_attempts,
        }
    }

    /// Raise the peaks of an instance. Each dimension moves independently and
    /// only upwards; its timestamp changes only when its peak does.
    pub async fn record_instance_metric(
        &self,
        key: &InstanceKey,
        cpu: f64,
        memory: f64,
        observed_at: i64,
    ) -> Result<PluginMetric, StoreError> {
        let record = update_record(
            self.instances.as_ref(),
            &key.storage_key(),
            self.cas_attempts,
            |current| match current {
                None => Some(PluginMetric {
                    cpu,
                    cpu_time: observed_at,
                    memory,
                    memory_time: observed_at,
                }),
                Some(peak) => {
                    let mut next = *peak;
                    if cpu > peak.cpu {
                        next.cpu = cpu;
                        next.cpu_time = observed_at;
                    }
                    if memory > peak.memory {
                        next.memory = memory;
                        next.memory_time = observed_at;
                    }
                    (next != *peak).then_some(next)
                }
            },
        )
        .await?;

        Ok(record.map(|r| r.value).unwrap_or_default())
    }

    /// Overwrite the latest metric of an agent
    pub async fn record_agent_metric(
        &self,
        agent_id: &str,
        metric: AgentMetric,
    ) -> Result<(), StoreError> {
        update_record(self.agents.as_ref(), agent_id, self.cas_attempts, |_| {
            Some(metric)
        })
        .await?;
        Ok(())
    }

    pub async fn instance_metric(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<PluginMetric>, StoreError> {
        Ok(self.instances.get(&key.storage_key()).await?.map(|r| r.value))
    }

    pub async fn agent_metric(&self, agent_id: &str) -> Result<Option<AgentMetric>, StoreError> {
        Ok(self.agents.get(agent_id).await?.map(|r| r.value))
    }

    pub async fn list_instance_metrics(
        &self,
    ) -> Result<Vec<(InstanceKey, PluginMetric)>, StoreError> {
        let mut metrics: Vec<(InstanceKey, PluginMetric)> = self
            .instances
            .list()
            .await?
            .into_iter()
            .filter_map(|(k, r)| InstanceKey::from_storage_key(&k).map(|key| (key, r.value)))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(metrics)
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        remove_record(self.agents.as_ref(), agent_id, self.cas_attempts).await?;
        Ok(())
    }
}
