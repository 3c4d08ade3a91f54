//! Key-value coordination store contract and an in-process implementation
//!
//! The contract mirrors what etcd-style stores offer: revisions on every write,
//! transactional compare-and-swap on a key's revision, prefix listing and a
//! watch stream of changes.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const WATCH_CAPACITY: usize = 1024;

/// A stored value and the revision of its last modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Result of a compare-and-swap transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvTxn {
    /// Committed at the given revision
    Committed(u64),
    /// Compare failed; carries the current entry
    Failed(Option<KvEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Put,
    Delete,
}

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchKind,
    pub revision: u64,
}

/// External key-value store shared by manager replicas
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Unconditional write; returns the new revision
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError>;

    /// Write only if the key's revision equals `expected_revision`
    /// (`None`: only if the key is absent)
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: Option<u64>,
        value: Vec<u8>,
    ) -> Result<KvTxn, StoreError>;

    /// Delete only if the key is still at `expected_revision`
    async fn compare_and_delete(&self, key: &str, expected_revision: u64)
        -> Result<bool, StoreError>;

    /// Unconditional delete; returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All entries whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, StoreError>;

    /// Stream of changes to keys starting with `prefix`
    fn watch(&self, prefix: &str) -> KvWatch;
}

/// Receiving side of a prefix watch
pub struct KvWatch {
    rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
}

impl KvWatch {
    pub fn new(rx: broadcast::Receiver<WatchEvent>, prefix: impl Into<String>) -> Self {
        Self {
            rx,
            prefix: prefix.into(),
        }
    }

    /// Next matching event, or `None` once the store is gone.
    /// Lagging watchers skip the missed events.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, prefix = %self.prefix, "Watch lagged, events skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Default)]
struct KvState {
    entries: BTreeMap<String, KvEntry>,
    revision: u64,
}

/// In-process [`KvStore`].
///
/// Several managers holding clones of one `Arc<MemoryKvStore>` behave like
/// replicas sharing an external store. It can be taken offline or slowed down
/// to exercise failure handling.
pub struct MemoryKvStore {
    state: Mutex<KvState>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(KvState::default()),
            events,
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Toggle reachability; while offline every call fails with `Unavailable`
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("Memory KV store taken offline");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied before every operation
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Current store revision
    pub fn revision(&self) -> u64 {
        self.lock_state().revision
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory kv store is offline".into()))
        }
    }

    fn publish(&self, key: &str, kind: WatchKind, revision: u64) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            key: key.to_string(),
            kind,
            revision,
        });
    }

    fn write_locked(state: &mut KvState, key: &str, value: Vec<u8>) -> u64 {
        state.revision += 1;
        let revision = state.revision;
        state
            .entries
            .insert(key.to_string(), KvEntry { value, revision });
        revision
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.enter().await?;
        Ok(self.lock_state().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        self.enter().await?;
        let revision = {
            let mut state = self.lock_state();
            Self::write_locked(&mut state, key, value)
        };
        self.publish(key, WatchKind::Put, revision);
        Ok(revision)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: Option<u64>,
        value: Vec<u8>,
    ) -> Result<KvTxn, StoreError> {
        self.enter().await?;
        let txn = {
            let mut state = self.lock_state();
            let current = state.entries.get(key).map(|e| e.revision);
            if current == expected_revision {
                KvTxn::Committed(Self::write_locked(&mut state, key, value))
            } else {
                KvTxn::Failed(state.entries.get(key).cloned())
            }
        };
        if let KvTxn::Committed(revision) = txn {
            self.publish(key, WatchKind::Put, revision);
        }
        Ok(txn)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        let revision = {
            let mut state = self.lock_state();
            match state.entries.get(key) {
                Some(entry) if entry.revision == expected_revision => {
                    state.entries.remove(key);
                    state.revision += 1;
                    Some(state.revision)
                }
                _ => None,
            }
        };
        match revision {
            Some(revision) => {
                self.publish(key, WatchKind::Delete, revision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        let revision = {
            let mut state = self.lock_state();
            if state.entries.remove(key).is_some() {
                state.revision += 1;
                Some(state.revision)
            } else {
                None
            }
        };
        match revision {
            Some(revision) => {
                self.publish(key, WatchKind::Delete, revision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, StoreError> {
        self.enter().await?;
        let state = self.lock_state();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> KvWatch {
        KvWatch::new(self.events.subscribe(), prefix)
    }
}
