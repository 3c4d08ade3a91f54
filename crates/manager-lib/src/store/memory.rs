//! In-process record store backed by a sharded concurrent map

use super::{CasOutcome, RecordStore, Versioned};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Record store for a single manager replica.
///
/// Each CAS runs under the map shard's entry lock, so compare and write are one
/// atomic step. Versions come from one counter and are never reused.
pub struct MemoryStore<V> {
    entries: DashMap<String, Versioned<V>>,
    revision: AtomicU64,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            revision: AtomicU64::new(0),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl<V> RecordStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>, StoreError> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
    ) -> Result<CasOutcome<V>, StoreError> {
        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get().version) {
                    let record = Versioned {
                        value,
                        version: self.next_revision(),
                    };
                    occupied.insert(record.clone());
                    CasOutcome::Swapped(record)
                } else {
                    CasOutcome::Conflict(Some(occupied.get().clone()))
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    let record = Versioned {
                        value,
                        version: self.next_revision(),
                    };
                    vacant.insert(record.clone());
                    CasOutcome::Swapped(record)
                } else {
                    CasOutcome::Conflict(None)
                }
            }
        };
        Ok(outcome)
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .remove_if(key, |_, record| record.version == expected)
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|r| r.key().clone()).collect())
    }

    async fn list(&self) -> Result<Vec<(String, Versioned<V>)>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }
}
