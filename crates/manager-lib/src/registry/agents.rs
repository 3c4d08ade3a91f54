//! Registry of known agents and their heartbeats

use super::prefixes;
use crate::clock::{elapsed_since, Clock};
use crate::error::StoreError;
use crate::models::{Agent, AgentMetric, AgentReport};
use crate::store::{remove_record, update_record, RecordStore, StorageBackend, Versioned};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Marker left behind by an explicit unregister
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub unregistered_at: i64,
}

/// Known agents, keyed by agent id
pub struct AgentRegistry {
    agents: Arc<dyn RecordStore<Agent>>,
    tombstones: Arc<dyn RecordStore<Tombstone>>,
    clock: Arc<dyn Clock>,
    cas_attempts: usize,
}

impl AgentRegistry {
    pub fn new(backend: &StorageBackend, clock: Arc<dyn Clock>, cas_attempts: usize) -> Self {
        Self {
            agents: backend.open(prefixes::AGENTS),
            tombstones: backend.open(prefixes::TOMBSTONES),
            clock,
            cas_attempts,
        }
    }

    /// Insert or overwrite an agent; clears an earlier unregister
    pub async fn register(&self, agent_id: &str, agent_ip: &str) -> Result<Agent, StoreError> {
        remove_record(self.tombstones.as_ref(), agent_id, self.cas_attempts).await?;

        let now = self.clock.now_millis();
        let record = update_record(self.agents.as_ref(), agent_id, self.cas_attempts, |current| {
            Some(Agent {
                agent_id: agent_id.to_string(),
                agent_ip: agent_ip.to_string(),
                metric: current.map(|a| a.metric).unwrap_or_default(),
                running_instances: current
                    .map(|a| a.running_instances.clone())
                    .unwrap_or_default(),
                registered_at: current.map(|a| a.registered_at).unwrap_or(now),
                last_timestamp: now,
            })
        })
        .await?;

        info!(agent_id = %agent_id, agent_ip = %agent_ip, "Agent registered");
        Ok(record.map(|r| r.value).unwrap_or_else(|| unreachable_agent(agent_id)))
    }

    /// Remove an agent and leave a tombstone so late reports cannot bring it back
    pub async fn unregister(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let tombstone = Tombstone {
            unregistered_at: self.clock.now_millis(),
        };
        update_record(self.tombstones.as_ref(), agent_id, self.cas_attempts, |_| {
            Some(tombstone.clone())
        })
        .await?;

        let removed = remove_record(self.agents.as_ref(), agent_id, self.cas_attempts).await?;
        info!(agent_id = %agent_id, existed = removed.is_some(), "Agent unregistered");
        Ok(removed)
    }

    pub async fn is_tombstoned(&self, agent_id: &str) -> Result<bool, StoreError> {
        Ok(self.tombstones.get(agent_id).await?.is_some())
    }

    /// Heartbeat path. Refreshes the agent's clock and state; unknown agents are
    /// registered implicitly, tombstoned ones are refused with `Ok(None)`.
    pub async fn heartbeat(&self, report: &AgentReport) -> Result<Option<Agent>, StoreError> {
        let agent_id = report.agent_id.as_str();
        if self.is_tombstoned(agent_id).await? {
            debug!(agent_id = %agent_id, "Ignoring report from unregistered agent");
            return Ok(None);
        }

        let now = self.clock.now_millis();
        let mut metric = report.metric;
        if metric.last_timestamp == 0 {
            metric.last_timestamp = now;
        }

        let written = update_record(self.agents.as_ref(), agent_id, self.cas_attempts, |current| {
            Some(Agent {
                agent_id: agent_id.to_string(),
                agent_ip: report.agent_ip.clone(),
                metric,
                running_instances: report.running_instances.clone(),
                registered_at: current.map(|a| a.registered_at).unwrap_or(now),
                last_timestamp: now,
            })
        })
        .await?;

        let Some(written) = written else {
            return Ok(None);
        };

        // An unregister may have landed between the tombstone check and the write.
        // Its tombstone is written before the agent is deleted, so re-checking here
        // catches it and undoes our write.
        if self.is_tombstoned(agent_id).await? {
            self.agents
                .compare_and_delete(agent_id, written.version)
                .await?;
            debug!(agent_id = %agent_id, "Report raced with unregister, discarded");
            return Ok(None);
        }

        Ok(Some(written.value))
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.get(agent_id).await?.map(|r| r.value))
    }

    pub async fn list(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self
            .agents
            .list()
            .await?
            .into_iter()
            .map(|(_, r)| r.value)
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.agents.keys().await?.len())
    }

    /// Agents whose last heartbeat is older than `timeout`, with their versions
    pub async fn stale(&self, timeout: Duration) -> Result<Vec<Versioned<Agent>>, StoreError> {
        Ok(self
            .agents
            .list()
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| elapsed_since(self.clock.as_ref(), r.value.last_timestamp) > timeout)
            .collect())
    }

    /// Delete an agent only if nothing refreshed it since `seen` was read
    pub async fn evict(&self, seen: &Versioned<Agent>) -> Result<bool, StoreError> {
        self.agents
            .compare_and_delete(&seen.value.agent_id, seen.version)
            .await
    }

    /// Latest metric of an agent
    pub async fn metric(&self, agent_id: &str) -> Result<Option<AgentMetric>, StoreError> {
        Ok(self.get(agent_id).await?.map(|a| a.metric))
    }
}

// update_record only returns None when the closure declines to write, which the
// register closure never does
fn unreachable_agent(agent_id: &str) -> Agent {
    Agent {
        agent_id: agent_id.to_string(),
        agent_ip: String::new(),
        metric: AgentMetric::default(),
        running_instances: Vec::new(),
        registered_at: 0,
        last_timestamp: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(clock: Arc<ManualClock>) -> AgentRegistry {
        AgentRegistry::new(&StorageBackend::Memory, clock, 8)
    }

    fn report(agent_id: &str) -> AgentReport {
        AgentReport {
            agent_id: agent_id.to_string(),
            agent_ip: "10.0.0.7".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_overwrites_ip_and_keeps_registered_at() {
        let clock = Arc::new(ManualClock::new(1_000));
        let agents = registry(clock.clone());

        agents.register("a1", "10.0.0.1").await.unwrap();
        clock.advance(Duration::from_secs(5));
        let agent = agents.register("a1", "10.0.0.2").await.unwrap();

        assert_eq!(agent.agent_ip, "10.0.0.2");
        assert_eq!(agent.registered_at, 1_000);
        assert_eq!(agent.last_timestamp, 6_000);
        assert_eq!(agents.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_first_report_registers_implicitly() {
        let clock = Arc::new(ManualClock::new(1_000));
        let agents = registry(clock);

        let agent = agents.heartbeat(&report("a1")).await.unwrap().unwrap();
        assert_eq!(agent.agent_ip, "10.0.0.7");
        assert!(agents.get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_report_after_unregister_is_rejected() {
        let clock = Arc::new(ManualClock::new(1_000));
        let agents = registry(clock);

        agents.register("a1", "10.0.0.1").await.unwrap();
        let removed = agents.unregister("a1").await.unwrap();
        assert!(removed.is_some());

        assert!(agents.heartbeat(&report("a1")).await.unwrap().is_none());
        assert!(agents.get("a1").await.unwrap().is_none());

        // Explicit registration lifts the tombstone
        agents.register("a1", "10.0.0.1").await.unwrap();
        assert!(agents.heartbeat(&report("a1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_resets_eviction_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let agents = registry(clock.clone());
        let timeout = Duration::from_secs(60);

        agents.heartbeat(&report("a1")).await.unwrap();
        agents.heartbeat(&report("a2")).await.unwrap();
        clock.advance(Duration::from_secs(50));
        agents.heartbeat(&report("a2")).await.unwrap();
        clock.advance(Duration::from_secs(20));

        let stale: Vec<String> = agents
            .stale(timeout)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.value.agent_id)
            .collect();
        assert_eq!(stale, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_evict_loses_to_fresh_heartbeat() {
        let clock = Arc::new(ManualClock::new(0));
        let agents = registry(clock.clone());

        agents.heartbeat(&report("a1")).await.unwrap();
        clock.advance(Duration::from_secs(120));
        let seen = agents.stale(Duration::from_secs(60)).await.unwrap().remove(0);

        agents.heartbeat(&report("a1")).await.unwrap();
        assert!(!agents.evict(&seen).await.unwrap());
        assert!(agents.get("a1").await.unwrap().is_some());
    }
}
