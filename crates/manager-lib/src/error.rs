//! Error types for the manager library

use std::time::Duration;
use thiserror::Error;

/// Failures talking to a record or key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("gave up on key {key} after {attempts} conflicting writes")]
    Contended { key: String, attempts: usize },

    #[error("lock {resource} not acquired within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },
}

impl StoreError {
    /// Whether retrying later can succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Codec(_))
    }

    /// Whether the error says the store itself could not be reached
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Errors surfaced by manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("agent {0} was unregistered")]
    AgentUnregistered(String),

    #[error("task queue is full")]
    QueueFull,

    #[error("task queue is closed")]
    QueueClosed,

    #[error("no agent available for placement")]
    NoAgentAvailable,

    #[error("command to agent {agent_id} failed: {message}")]
    AgentCommand { agent_id: String, message: String },

    #[error("desired state unavailable: {0}")]
    DesiredState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ManagerError {
    /// The underlying store error, if this is one that says the store is unreachable
    pub fn store_unavailable(&self) -> Option<&StoreError> {
        match self {
            ManagerError::Store(e) if e.is_unavailable() => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        let codec = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(!StoreError::Codec(codec).is_transient());
    }

    #[test]
    fn test_manager_error_wraps_store_error() {
        let err: ManagerError = StoreError::Unavailable("etcd".into()).into();
        assert_eq!(err.to_string(), "store unavailable: etcd");
    }
}
