//! Named mutual exclusion for sections that must be serialized across replicas
//!
//! A single manager uses [`LocalCoordinator`], a thin layer over [`KeyedLock`].
//! Replicas sharing a [`KvStore`] use [`KvCoordinator`], which holds a lease
//! key per resource and renews it in the background while the guard is held.
//! Guards must be released explicitly with [`CoordinationGuard::release`]; a
//! dropped distributed guard stops renewing and is freed when its lease expires.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::lock::KeyedLock;
use crate::store::{KvStore, KvTxn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Well-known resource names
pub mod resources {
    pub const AGENT_CLEANUP: &str = "agent-cleanup";

    /// Serializes reports and unregistration of one agent
    pub fn agent(agent_id: &str) -> String {
        format!("agent:{}", agent_id)
    }
}

/// Acquires named locks
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn acquire(&self, resource: &str) -> Result<CoordinationGuard, StoreError>;
}

enum GuardInner {
    Local(OwnedRwLockWriteGuard<()>),
    Lease {
        kv: Arc<dyn KvStore>,
        key: String,
        keepalive: Keepalive,
    },
    Released,
}

/// Background renewal of a held lease
struct Keepalive {
    stop: oneshot::Sender<()>,
    /// Yields the revision of the last successful renewal
    task: JoinHandle<u64>,
    acquired_revision: u64,
}

impl Keepalive {
    /// Stop renewing; returns the revision the lease is currently held at
    async fn stop(self) -> u64 {
        let Keepalive {
            stop,
            task,
            acquired_revision,
        } = self;
        let _ = stop.send(());
        task.await.unwrap_or(acquired_revision)
    }
}

/// Proof of holding a named lock
pub struct CoordinationGuard {
    resource: String,
    inner: GuardInner,
}

impl CoordinationGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Give the lock back
    pub async fn release(mut self) {
        match std::mem::replace(&mut self.inner, GuardInner::Released) {
            GuardInner::Local(guard) => drop(guard),
            GuardInner::Lease { kv, key, keepalive } => {
                let revision = keepalive.stop().await;
                match kv.compare_and_delete(&key, revision).await {
                    Ok(true) => debug!(resource = %self.resource, "Lease released"),
                    Ok(false) => warn!(
                        resource = %self.resource,
                        "Lease was taken over before release"
                    ),
                    Err(e) => warn!(
                        resource = %self.resource,
                        error = %e,
                        "Failed to release lease, it will expire"
                    ),
                }
            }
            GuardInner::Released => {}
        }
    }
}

impl fmt::Debug for CoordinationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            GuardInner::Local(_) => "local",
            GuardInner::Lease { .. } => "lease",
            GuardInner::Released => "released",
        };
        f.debug_struct("CoordinationGuard")
            .field("resource", &self.resource)
            .field("kind", &kind)
            .finish()
    }
}

impl Drop for CoordinationGuard {
    fn drop(&mut self) {
        if let GuardInner::Lease { keepalive, .. } = &self.inner {
            keepalive.task.abort();
            debug!(resource = %self.resource, "Lease guard dropped without release");
        }
    }
}

/// Process-local coordinator
pub struct LocalCoordinator {
    locks: KeyedLock,
    timeout: Duration,
}

impl LocalCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: KeyedLock::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn acquire(&self, resource: &str) -> Result<CoordinationGuard, StoreError> {
        match self.locks.write_timeout(resource, self.timeout).await {
            Some(guard) => Ok(CoordinationGuard {
                resource: resource.to_string(),
                inner: GuardInner::Local(guard),
            }),
            None => Err(StoreError::LockTimeout {
                resource: resource.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Value stored under a lease key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at: i64,
}

impl Lease {
    fn encode(owner: &str, clock: &dyn Clock, ttl: Duration) -> Result<Vec<u8>, StoreError> {
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: clock.now_millis() + ttl.as_millis() as i64,
        };
        Ok(serde_json::to_vec(&lease)?)
    }
}

/// Settings for [`KvCoordinator`]
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a lease lives without being renewed; renewed every third of it
    pub ttl: Duration,
    /// Upper bound on waiting for a lock
    pub acquire_timeout: Duration,
    /// Bound on each store call
    pub op_timeout: Duration,
    /// Re-check interval when no watch event arrives
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            acquire_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(3),
            retry_interval: Duration::from_millis(250),
        }
    }
}

/// Distributed coordinator built on lease keys in a shared store
pub struct KvCoordinator {
    kv: Arc<dyn KvStore>,
    owner: String,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl KvCoordinator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        owner: impl Into<String>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            kv,
            owner: owner.into(),
            clock,
            config,
        }
    }

    fn lease_key(resource: &str) -> String {
        format!("/locks/{}", resource)
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        tokio::time::timeout(self.config.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
    }

    fn new_lease(&self) -> Result<Vec<u8>, StoreError> {
        Lease::encode(&self.owner, self.clock.as_ref(), self.config.ttl)
    }

    fn guard(&self, resource: &str, key: String, revision: u64) -> CoordinationGuard {
        CoordinationGuard {
            resource: resource.to_string(),
            inner: GuardInner::Lease {
                kv: self.kv.clone(),
                keepalive: self.spawn_keepalive(key.clone(), revision),
                key,
            },
        }
    }

    /// Renew the lease at `revision` until stopped or lost
    fn spawn_keepalive(&self, key: String, revision: u64) -> Keepalive {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let kv = self.kv.clone();
        let owner = self.owner.clone();
        let clock = self.clock.clone();
        let ttl = self.config.ttl;
        let op_timeout = self.config.op_timeout;
        let period = (ttl / 3).max(Duration::from_millis(10));

        let task = tokio::spawn(async move {
            let mut revision = revision;
            loop {
                tokio::select! {
                    _ = &mut stopped => return revision,
                    _ = tokio::time::sleep(period) => {}
                }

                let lease = match Lease::encode(&owner, clock.as_ref(), ttl) {
                    Ok(lease) => lease,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to encode lease renewal");
                        continue;
                    }
                };
                match tokio::time::timeout(
                    op_timeout,
                    kv.compare_and_swap(&key, Some(revision), lease),
                )
                .await
                {
                    Ok(Ok(KvTxn::Committed(next))) => revision = next,
                    Ok(Ok(KvTxn::Failed(_))) => {
                        warn!(key = %key, owner = %owner, "Lease lost while held");
                        return revision;
                    }
                    Ok(Err(e)) => warn!(key = %key, error = %e, "Lease renewal failed"),
                    Err(_) => warn!(key = %key, "Lease renewal timed out"),
                }
            }
        });

        Keepalive {
            stop,
            task,
            acquired_revision: revision,
        }
    }
}

#[async_trait]
impl Coordinator for KvCoordinator {
    async fn acquire(&self, resource: &str) -> Result<CoordinationGuard, StoreError> {
        let key = Self::lease_key(resource);
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut watch = self.kv.watch(&key);

        loop {
            let lease = self.new_lease()?;
            let retry_now = match self
                .bounded(self.kv.compare_and_swap(&key, None, lease.clone()))
                .await?
            {
                KvTxn::Committed(revision) => return Ok(self.guard(resource, key, revision)),
                KvTxn::Failed(Some(held)) => {
                    let expired = match serde_json::from_slice::<Lease>(&held.value) {
                        Ok(current) => current.expires_at <= self.clock.now_millis(),
                        Err(_) => true,
                    };
                    if expired {
                        let txn = self
                            .bounded(self.kv.compare_and_swap(&key, Some(held.revision), lease))
                            .await?;
                        if let KvTxn::Committed(revision) = txn {
                            warn!(resource = %resource, owner = %self.owner, "Took over expired lease");
                            return Ok(self.guard(resource, key, revision));
                        }
                    }
                    false
                }
                // Released between our attempt and the read
                KvTxn::Failed(None) => true,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::LockTimeout {
                    resource: resource.to_string(),
                    timeout: self.config.acquire_timeout,
                });
            }
            if retry_now {
                continue;
            }
            let _ = tokio::time::timeout(remaining.min(self.config.retry_interval), watch.next())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::{KvEntry, KvWatch, MemoryKvStore};

    fn kv_coordinator(
        kv: &Arc<MemoryKvStore>,
        owner: &str,
        clock: Arc<dyn Clock>,
        acquire_timeout: Duration,
    ) -> KvCoordinator {
        KvCoordinator::new(
            kv.clone(),
            owner,
            clock,
            LeaseConfig {
                acquire_timeout,
                retry_interval: Duration::from_secs(10),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_local_coordinator_excludes() {
        let coordinator = LocalCoordinator::new(Duration::from_millis(50));
        let guard = coordinator.acquire("agent:a").await.unwrap();
        assert_eq!(
            format!("{:?}", guard),
            "CoordinationGuard { resource: \"agent:a\", kind: \"local\" }"
        );

        let err = coordinator.acquire("agent:a").await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(coordinator.acquire("agent:b").await.is_ok());

        guard.release().await;
        assert!(coordinator.acquire("agent:a").await.is_ok());
    }

    #[tokio::test]
    async fn test_kv_coordinator_excludes_other_replica() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let m1 = kv_coordinator(&kv, "m1", clock.clone(), Duration::from_millis(50));
        let m2 = kv_coordinator(&kv, "m2", clock, Duration::from_millis(50));

        let guard = m1.acquire(resources::AGENT_CLEANUP).await.unwrap();
        assert!(matches!(
            m2.acquire(resources::AGENT_CLEANUP).await,
            Err(StoreError::LockTimeout { .. })
        ));

        guard.release().await;
        assert!(m2.acquire(resources::AGENT_CLEANUP).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release_event() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let m1 = kv_coordinator(&kv, "m1", clock.clone(), Duration::from_secs(2));
        let m2 = kv_coordinator(&kv, "m2", clock, Duration::from_secs(2));

        let guard = m1.acquire("agent:a").await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            guard.release().await;
        });

        // Retry interval is 10s, so only the watch event can wake the waiter in time
        let started = std::time::Instant::now();
        let acquired = m2.acquire("agent:a").await;
        assert!(acquired.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let m1 = kv_coordinator(&kv, "m1", clock.clone(), Duration::from_millis(50));
        let m2 = kv_coordinator(&kv, "m2", clock.clone(), Duration::from_millis(50));

        let abandoned = m1.acquire("agent-cleanup").await.unwrap();
        drop(abandoned);
        assert!(m2.acquire("agent-cleanup").await.is_err());

        clock.advance(Duration::from_secs(16));
        let guard = m2.acquire("agent-cleanup").await.unwrap();
        assert_eq!(guard.resource(), "agent-cleanup");
    }

    #[tokio::test]
    async fn test_offline_store_is_not_a_lock_timeout() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set_available(false);
        let m1 = kv_coordinator(&kv, "m1", Arc::new(SystemClock), Duration::from_millis(50));

        let err = m1.acquire("agent:a").await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_held_lease_is_renewed_past_ttl() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let short = |owner: &str| {
            KvCoordinator::new(
                kv.clone(),
                owner,
                clock.clone(),
                LeaseConfig {
                    ttl: Duration::from_millis(150),
                    acquire_timeout: Duration::from_millis(50),
                    retry_interval: Duration::from_millis(10),
                    ..Default::default()
                },
            )
        };
        let m1 = short("m1");
        let m2 = short("m2");

        let guard = m1.acquire("agent:a").await.unwrap();
        assert!(format!("{:?}", guard).contains("lease"));

        // Several TTLs pass while the holder is still working
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(matches!(
                m2.acquire("agent:a").await,
                Err(StoreError::LockTimeout { .. })
            ));
        }

        guard.release().await;
        assert!(kv.get("/locks/agent:a").await.unwrap().is_none());
        assert!(m2.acquire("agent:a").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_lease_stops_renewing() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = LeaseConfig {
            ttl: Duration::from_millis(90),
            acquire_timeout: Duration::from_millis(20),
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let m1 = KvCoordinator::new(kv.clone(), "m1", clock.clone(), config.clone());
        let m2 = KvCoordinator::new(kv.clone(), "m2", clock, config);

        let abandoned = m1.acquire("agent-cleanup").await.unwrap();
        drop(abandoned);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(m2.acquire("agent-cleanup").await.is_ok());
    }

    /// Every CAS loses to a writer that already deleted the key again
    struct ChurningStore {
        inner: MemoryKvStore,
    }

    #[async_trait]
    impl KvStore for ChurningStore {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
            self.inner.put(key, value).await
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected_revision: Option<u64>,
            _value: Vec<u8>,
        ) -> Result<KvTxn, StoreError> {
            Ok(KvTxn::Failed(None))
        }

        async fn compare_and_delete(
            &self,
            key: &str,
            expected_revision: u64,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_delete(key, expected_revision).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, StoreError> {
            self.inner.list(prefix).await
        }

        fn watch(&self, prefix: &str) -> KvWatch {
            self.inner.watch(prefix)
        }
    }

    #[tokio::test]
    async fn test_acquire_under_churn_respects_deadline() {
        let kv = Arc::new(ChurningStore {
            inner: MemoryKvStore::new(),
        });
        let m1 = KvCoordinator::new(
            kv,
            "m1",
            Arc::new(SystemClock),
            LeaseConfig {
                acquire_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        );

        let err = tokio::time::timeout(Duration::from_secs(2), m1.acquire("agent:a"))
            .await
            .expect("acquire kept spinning past its deadline")
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }
}
