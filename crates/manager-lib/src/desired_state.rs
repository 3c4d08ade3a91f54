//! Sources of the set of instances that should be running

use crate::models::InstanceKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;

/// Feed of desired instances, polled by the desired-state monitor
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn desired(&self) -> Result<BTreeSet<InstanceKey>>;
}

/// In-memory desired set, replaced wholesale
#[derive(Debug, Default)]
pub struct StaticDesiredState {
    keys: RwLock<BTreeSet<InstanceKey>>,
}

impl StaticDesiredState {
    pub fn new(keys: impl IntoIterator<Item = InstanceKey>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().collect()),
        }
    }

    pub fn replace(&self, keys: impl IntoIterator<Item = InstanceKey>) {
        let next: BTreeSet<InstanceKey> = keys.into_iter().collect();
        match self.keys.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[async_trait]
impl DesiredStateSource for StaticDesiredState {
    async fn desired(&self) -> Result<BTreeSet<InstanceKey>> {
        Ok(match self.keys.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        })
    }
}

/// JSON file holding an array of `{"instance_id", "version"}` objects,
/// re-read on every poll
#[derive(Debug, Clone)]
pub struct FileDesiredState {
    path: PathBuf,
}

impl FileDesiredState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DesiredStateSource for FileDesiredState {
    async fn desired(&self) -> Result<BTreeSet<InstanceKey>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read desired state from {:?}", self.path))?;
        let keys: Vec<InstanceKey> = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid desired state in {:?}", self.path))?;
        Ok(keys.into_iter().collect())
    }
}
