//! Lazily created reader/writer locks keyed by string
//!
//! One `tokio::sync::RwLock` exists per key. Lookup takes a shard read lock; only
//! on a miss is the shard write-locked, re-checked and the new lock installed, so
//! every caller for a key ends up with the same lock object. Keys hash to shards,
//! so creating locks for unrelated keys does not serialize on a single map.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const DEFAULT_SHARDS: usize = 16;

type Shard = StdRwLock<HashMap<String, Arc<RwLock<()>>>>;

/// Sharded table of per-key reader/writer locks
pub struct KeyedLock {
    shards: Vec<Shard>,
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| StdRwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// The lock for `key`, created on first use
    pub fn handle(&self, key: &str) -> Arc<RwLock<()>> {
        let shard = self.shard(key);

        {
            let map = shard.read().unwrap_or_else(|e| e.into_inner());
            if let Some(lock) = map.get(key) {
                return lock.clone();
            }
        }

        let mut map = shard.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared access to `key`
    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.handle(key).read_owned().await
    }

    /// Exclusive access to `key`
    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.handle(key).write_owned().await
    }

    /// Exclusive access to `key`, or `None` if not granted within `timeout`
    pub async fn write_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Option<OwnedRwLockWriteGuard<()>> {
        tokio::time::timeout(timeout, self.write(key)).await.ok()
    }

    /// Number of keys with a lock allocated
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop locks nobody holds or waits on; returns how many were removed
    pub fn prune(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.write().unwrap_or_else(|e| e.into_inner());
            let before = map.len();
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            removed += before - map.len();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_same_key_same_lock() {
        let locks = KeyedLock::new();
        let a = locks.handle("row-1");
        let b = locks.handle("row-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_one_lock() {
        let locks = Arc::new(KeyedLock::with_shards(2));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move { locks.handle("hot") }));
        }

        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        assert!(seen.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_readers_share_the_lock() {
        let locks = KeyedLock::new();
        let _r1 = locks.read("row").await;
        let r2 = tokio::time::timeout(SHORT, locks.read("row")).await;
        assert!(r2.is_ok(), "second reader should not block");
    }

    #[tokio::test]
    async fn test_writer_excludes_readers_and_writers() {
        let locks = KeyedLock::new();
        let w = locks.write("row").await;

        assert!(tokio::time::timeout(SHORT, locks.read("row")).await.is_err());
        assert!(locks.write_timeout("row", SHORT).await.is_none());

        drop(w);
        assert!(locks.write_timeout("row", SHORT).await.is_some());
    }

    #[tokio::test]
    async fn test_reader_excludes_writer() {
        let locks = KeyedLock::new();
        let _r = locks.read("row").await;
        assert!(locks.write_timeout("row", SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = KeyedLock::with_shards(1);
        let _a = locks.write("a").await;
        assert!(locks.write_timeout("b", SHORT).await.is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyedLock::new();
        let held = locks.write("held").await;
        locks.handle("idle");

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
