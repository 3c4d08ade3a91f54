//! Versioned record storage
//!
//! Registries never own a map directly. They talk to a [`RecordStore`], a typed
//! key/value table where every record carries a store-wide monotonic version and
//! every write is a compare-and-swap against the version the writer last read.
//! Two backends exist:
//! - [`MemoryStore`]: a concurrent map, for a single manager replica
//! - [`KvBackedStore`]: JSON records in a shared [`KvStore`], for several replicas

mod kv;
mod kv_backed;
mod memory;

pub use kv::{KvEntry, KvStore, KvTxn, KvWatch, MemoryKvStore, WatchEvent, WatchKind};
pub use kv_backed::KvBackedStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A stored value together with the version it was written at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<V> {
    /// The write landed; carries the new record
    Swapped(Versioned<V>),
    /// Another writer got there first; carries what is stored now
    Conflict(Option<Versioned<V>>),
}

impl<V> CasOutcome<V> {
    pub fn is_swapped(&self) -> bool {
        matches!(self, CasOutcome::Swapped(_))
    }
}

/// Typed table with optimistic concurrency
#[async_trait]
pub trait RecordStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>, StoreError>;

    /// Write `value` if the stored version equals `expected`.
    /// `expected = None` means the key must not exist.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
    ) -> Result<CasOutcome<V>, StoreError>;

    /// Delete the record if it is still at version `expected`
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StoreError>;

    /// Snapshot of the current keys
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Snapshot of all records
    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>, StoreError>;
}

/// Read-modify-CAS loop.
///
/// `apply` sees the current value (if any) and returns the replacement, or
/// `None` to leave the record untouched. Conflicts re-read and re-apply, up to
/// `max_attempts` times.
pub async fn update_record<V, F>(
    store: &dyn RecordStore<V>,
    key: &str,
    max_attempts: usize,
    mut apply: F,
) -> Result<Option<Versioned<V>>, StoreError>
where
    V: Clone + Send + Sync + 'static,
    F: FnMut(Option<&V>) -> Option<V> + Send,
{
    let attempts = max_attempts.max(1);
    for _ in 0..attempts {
        let current = store.get(key).await?;
        let next = match apply(current.as_ref().map(|c| &c.value)) {
            Some(next) => next,
            None => return Ok(current),
        };

        let expected = current.as_ref().map(|c| c.version);
        match store.compare_and_swap(key, expected, next).await? {
            CasOutcome::Swapped(record) => return Ok(Some(record)),
            CasOutcome::Conflict(_) => continue,
        }
    }

    Err(StoreError::Contended {
        key: key.to_string(),
        attempts,
    })
}

/// Delete whatever is stored under `key`, re-reading on conflict.
/// Returns the value that was removed.
pub async fn remove_record<V>(
    store: &dyn RecordStore<V>,
    key: &str,
    max_attempts: usize,
) -> Result<Option<V>, StoreError>
where
    V: Clone + Send + Sync + 'static,
{
    let attempts = max_attempts.max(1);
    for _ in 0..attempts {
        let Some(current) = store.get(key).await? else {
            return Ok(None);
        };
        if store.compare_and_delete(key, current.version).await? {
            return Ok(Some(current.value));
        }
    }

    Err(StoreError::Contended {
        key: key.to_string(),
        attempts,
    })
}

/// Where registries keep their records, chosen when the manager is built
#[derive(Clone)]
pub enum StorageBackend {
    /// Process-local maps
    Memory,
    /// Shared key-value store; every operation bounded by `timeout`
    Kv {
        store: Arc<dyn KvStore>,
        timeout: Duration,
    },
}

impl std::fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => f.write_str("Memory"),
            StorageBackend::Kv { timeout, .. } => {
                f.debug_struct("Kv").field("timeout", timeout).finish()
            }
        }
    }
}

impl StorageBackend {
    /// Open a typed table; `prefix` namespaces it inside a shared store
    pub fn open<V>(&self, prefix: &str) -> Arc<dyn RecordStore<V>>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match self {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Kv { store, timeout } => {
                Arc::new(KvBackedStore::new(store.clone(), prefix, *timeout))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Kv { .. } => "kv",
        }
    }
}
