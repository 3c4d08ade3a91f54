//! Placement and lifecycle records of plugin instances

use super::prefixes;
use crate::error::StoreError;
use crate::models::{InstanceKey, PluginRuntime, RuntimeStatus};
use crate::store::{CasOutcome, RecordStore, StorageBackend, Versioned};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of [`PluginRuntime`] records keyed by `instance_id/version`.
///
/// Every read fills `resource_version` from the store version, and every write
/// compares against the `resource_version` of the value the caller read.
#[derive(Clone)]
pub struct RuntimeRegistry {
    store: Arc<dyn RecordStore<PluginRuntime>>,
}

fn hydrate(record: Versioned<PluginRuntime>) -> PluginRuntime {
    let mut runtime = record.value;
    runtime.resource_version = record.version;
    runtime
}

impl RuntimeRegistry {
    pub fn new(backend: &StorageBackend) -> Self {
        Self {
            store: backend.open(prefixes::RUNTIMES),
        }
    }

    pub async fn get(&self, key: &InstanceKey) -> Result<Option<PluginRuntime>, StoreError> {
        Ok(self.store.get(&key.storage_key()).await?.map(hydrate))
    }

    /// Create the record only if the key is absent. Returns the stored record on
    /// success, `None` if another writer created it first.
    pub async fn create(&self, runtime: PluginRuntime) -> Result<Option<PluginRuntime>, StoreError> {
        let key = runtime.key().storage_key();
        match self.store.compare_and_swap(&key, None, runtime).await? {
            CasOutcome::Swapped(record) => Ok(Some(hydrate(record))),
            CasOutcome::Conflict(_) => Ok(None),
        }
    }

    /// Replace `current` with `next` if nobody wrote in between
    pub async fn compare_and_swap(
        &self,
        current: &PluginRuntime,
        next: PluginRuntime,
    ) -> Result<Option<PluginRuntime>, StoreError> {
        let key = current.key().storage_key();
        match self
            .store
            .compare_and_swap(&key, Some(current.resource_version), next)
            .await?
        {
            CasOutcome::Swapped(record) => Ok(Some(hydrate(record))),
            CasOutcome::Conflict(_) => Ok(None),
        }
    }

    /// Move `current` to `status`, stamping `now` as its last transition
    pub async fn compare_and_swap_status(
        &self,
        current: &PluginRuntime,
        status: RuntimeStatus,
        now: i64,
    ) -> Result<Option<PluginRuntime>, StoreError> {
        let next = PluginRuntime {
            status,
            last_timestamp: now,
            ..current.clone()
        };
        self.compare_and_swap(current, next).await
    }

    /// Write `runtime` whatever is stored, re-reading on conflict
    pub async fn upsert(
        &self,
        runtime: PluginRuntime,
        max_attempts: usize,
    ) -> Result<PluginRuntime, StoreError> {
        let key = runtime.key().storage_key();
        let attempts = max_attempts.max(1);
        for _ in 0..attempts {
            let expected = self.store.get(&key).await?.map(|r| r.version);
            if let CasOutcome::Swapped(record) = self
                .store
                .compare_and_swap(&key, expected, runtime.clone())
                .await?
            {
                return Ok(hydrate(record));
            }
        }
        Err(StoreError::Contended { key, attempts })
    }

    /// Delete `current` if it is still the stored version
    pub async fn delete(&self, current: &PluginRuntime) -> Result<bool, StoreError> {
        self.store
            .compare_and_delete(&current.key().storage_key(), current.resource_version)
            .await
    }

    /// Lazy traversal over a snapshot of the current keys
    pub async fn range(&self) -> Result<RuntimeRange, StoreError> {
        let keys = self.store.keys().await?;
        Ok(RuntimeRange {
            store: self.store.clone(),
            keys,
            position: 0,
        })
    }

    pub async fn keys(&self) -> Result<Vec<InstanceKey>, StoreError> {
        Ok(self
            .store
            .keys()
            .await?
            .iter()
            .filter_map(|k| InstanceKey::from_storage_key(k))
            .collect())
    }

    pub async fn list(&self) -> Result<Vec<PluginRuntime>, StoreError> {
        let mut runtimes: Vec<PluginRuntime> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|(_, r)| hydrate(r))
            .collect();
        runtimes.sort_by(|a, b| {
            a.instance_id
                .cmp(&b.instance_id)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(runtimes)
    }

    pub async fn owned_by(&self, agent_id: &str) -> Result<Vec<PluginRuntime>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.is_owned_by(agent_id))
            .collect())
    }

    /// Number of assigned (pending, pushed or running) records per agent
    pub async fn load_by_agent(&self) -> Result<HashMap<String, usize>, StoreError> {
        let mut load = HashMap::new();
        for runtime in self.list().await? {
            if runtime.status.is_assigned() && !runtime.agent_id.is_empty() {
                *load.entry(runtime.agent_id).or_insert(0) += 1;
            }
        }
        Ok(load)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<RuntimeStatus, usize>, StoreError> {
        let mut counts: HashMap<RuntimeStatus, usize> =
            RuntimeStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for runtime in self.list().await? {
            *counts.entry(runtime.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Restartable cursor over a key snapshot.
///
/// Records are fetched one at a time as the cursor advances; a key deleted
/// after the snapshot was taken is skipped. No lock is held between calls.
pub struct RuntimeRange {
    store: Arc<dyn RecordStore<PluginRuntime>>,
    keys: Vec<String>,
    position: usize,
}

impl RuntimeRange {
    pub async fn next(&mut self) -> Result<Option<PluginRuntime>, StoreError> {
        while self.position < self.keys.len() {
            let key = &self.keys[self.position];
            self.position += 1;
            if let Some(record) = self.store.get(key).await? {
                return Ok(Some(hydrate(record)));
            }
        }
        Ok(None)
    }

    /// Rewind to the first key of the same snapshot
    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(id: &str, agent: &str, status: RuntimeStatus) -> PluginRuntime {
        PluginRuntime {
            instance_id: id.to_string(),
            version: "1".to_string(),
            status,
            agent_id: agent.to_string(),
            agent_ip: String::new(),
            resource_version: 0,
            last_timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let runtimes = RuntimeRegistry::new(&StorageBackend::Memory);
        let first = runtimes
            .create(runtime("p1", "a1", RuntimeStatus::Pending))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().resource_version > 0);

        let second = runtimes
            .create(runtime("p1", "a2", RuntimeStatus::Pending))
            .await
            .unwrap();
        assert!(second.is_none());
        let stored = runtimes.get(&InstanceKey::new("p1", "1")).await.unwrap().unwrap();
        assert_eq!(stored.agent_id, "a1");
    }

    #[tokio::test]
    async fn test_stale_status_swap_fails() {
        let runtimes = RuntimeRegistry::new(&StorageBackend::Memory);
        let created = runtimes
            .create(runtime("p1", "a1", RuntimeStatus::Pending))
            .await
            .unwrap()
            .unwrap();

        let pushed = runtimes
            .compare_and_swap_status(&created, RuntimeStatus::Pushed, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.status, RuntimeStatus::Pushed);
        assert_eq!(pushed.last_timestamp, 10);

        // Writer holding the old version loses
        let stale = runtimes
            .compare_and_swap_status(&created, RuntimeStatus::Killing, 20)
            .await
            .unwrap();
        assert!(stale.is_none());
        assert!(!runtimes.delete(&created).await.unwrap());
        assert!(runtimes.delete(&pushed).await.unwrap());
    }

    #[tokio::test]
    async fn test_range_skips_deleted_and_restarts() {
        let runtimes = RuntimeRegistry::new(&StorageBackend::Memory);
        for id in ["p1", "p2", "p3"] {
            runtimes
                .create(runtime(id, "a1", RuntimeStatus::Running))
                .await
                .unwrap();
        }

        let mut range = runtimes.range().await.unwrap();
        assert_eq!(range.len(), 3);

        let doomed = runtimes.get(&InstanceKey::new("p2", "1")).await.unwrap().unwrap();
        runtimes.delete(&doomed).await.unwrap();

        let mut seen = Vec::new();
        while let Some(r) = range.next().await.unwrap() {
            seen.push(r.instance_id);
        }
        seen.sort();
        assert_eq!(seen, vec!["p1", "p3"]);

        range.restart();
        assert!(range.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_by_agent_ignores_killing() {
        let runtimes = RuntimeRegistry::new(&StorageBackend::Memory);
        runtimes.create(runtime("p1", "a1", RuntimeStatus::Running)).await.unwrap();
        runtimes.create(runtime("p2", "a1", RuntimeStatus::Pushed)).await.unwrap();
        runtimes.create(runtime("p3", "a1", RuntimeStatus::Killing)).await.unwrap();
        runtimes.create(runtime("p4", "a2", RuntimeStatus::Pending)).await.unwrap();

        let load = runtimes.load_by_agent().await.unwrap();
        assert_eq!(load.get("a1"), Some(&2));
        assert_eq!(load.get("a2"), Some(&1));

        let counts = runtimes.count_by_status().await.unwrap();
        assert_eq!(counts[&RuntimeStatus::Killing], 1);
        assert_eq!(counts[&RuntimeStatus::Running], 1);
        assert_eq!(runtimes.owned_by("a1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let runtimes = RuntimeRegistry::new(&StorageBackend::Memory);
        runtimes.create(runtime("p1", "a1", RuntimeStatus::Pending)).await.unwrap();
        let written = runtimes
            .upsert(runtime("p1", "a2", RuntimeStatus::Running), 4)
            .await
            .unwrap();
        assert_eq!(written.agent_id, "a2");
        assert_eq!(runtimes.keys().await.unwrap(), vec![InstanceKey::new("p1", "1")]);
    }
}
