//! Record store that keeps JSON records in a shared key-value store

use super::{CasOutcome, KvEntry, KvStore, KvTxn, RecordStore, Versioned};
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Typed view over one key prefix of a [`KvStore`].
///
/// Record versions are the store's modification revisions, so two replicas
/// comparing versions of the same key compare the same numbers.
pub struct KvBackedStore<V> {
    kv: Arc<dyn KvStore>,
    prefix: String,
    timeout: Duration,
    _marker: PhantomData<fn() -> V>,
}

impl<V> KvBackedStore<V> {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            timeout,
            _marker: PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

impl<V: DeserializeOwned> KvBackedStore<V> {
    fn decode(entry: &KvEntry) -> Result<Versioned<V>, StoreError> {
        Ok(Versioned {
            value: serde_json::from_slice(&entry.value)?,
            version: entry.revision,
        })
    }
}

#[async_trait]
impl<V> RecordStore<V> for KvBackedStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>, StoreError> {
        let full = self.full_key(key);
        let entry = self.bounded(self.kv.get(&full)).await?;
        entry.as_ref().map(Self::decode).transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
    ) -> Result<CasOutcome<V>, StoreError> {
        let full = self.full_key(key);
        let bytes = serde_json::to_vec(&value)?;
        let txn = self
            .bounded(self.kv.compare_and_swap(&full, expected, bytes))
            .await?;

        match txn {
            KvTxn::Committed(revision) => Ok(CasOutcome::Swapped(Versioned {
                value,
                version: revision,
            })),
            KvTxn::Failed(current) => Ok(CasOutcome::Conflict(
                current.as_ref().map(Self::decode).transpose()?,
            )),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        let full = self.full_key(key);
        self.bounded(self.kv.compare_and_delete(&full, expected))
            .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.bounded(self.kv.list(&self.prefix)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>, StoreError> {
        let entries = self.bounded(self.kv.list(&self.prefix)).await?;
        entries
            .iter()
            .filter_map(|(k, entry)| {
                k.strip_prefix(&self.prefix)
                    .map(|key| Self::decode(entry).map(|record| (key.to_string(), record)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn test_records_are_namespaced_by_prefix() {
        let kv = Arc::new(MemoryKvStore::new());
        let agents: KvBackedStore<String> =
            KvBackedStore::new(kv.clone(), "/agents/", Duration::from_secs(1));
        let tombstones: KvBackedStore<String> =
            KvBackedStore::new(kv.clone(), "/tombstones/", Duration::from_secs(1));

        agents
            .compare_and_swap("a1", None, "10.0.0.1".into())
            .await
            .unwrap();

        assert!(tombstones.get("a1").await.unwrap().is_none());
        assert_eq!(agents.keys().await.unwrap(), vec!["a1"]);
        assert!(kv.get("/agents/a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set_latency(Duration::from_millis(200));
        let store: KvBackedStore<u32> =
            KvBackedStore::new(kv.clone(), "/slow/", Duration::from_millis(20));

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_codec_error() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put("/nums/k", b"not json".to_vec()).await.unwrap();
        let store: KvBackedStore<u32> = KvBackedStore::new(kv, "/nums/", Duration::from_secs(1));

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }
}
