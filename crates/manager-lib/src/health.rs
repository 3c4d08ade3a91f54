//! Health check infrastructure for the fleet manager
//!
//! Provides component health tracking and status reporting for
//! liveness and readiness probes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Compute overall status from component statuses
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const INSTANCE_MONITOR: &str = "instance_monitor";
    pub const DESIRED_MONITOR: &str = "desired_monitor";
    pub const AGENT_MONITOR: &str = "agent_monitor";
    pub const STORE: &str = "store";

    pub const ALL: [&str; 5] = [
        SCHEDULER,
        INSTANCE_MONITOR,
        DESIRED_MONITOR,
        AGENT_MONITOR,
        STORE,
    ];
}

/// Health registry for tracking component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Update component health status
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    /// Mark component as healthy
    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Mark component as degraded
    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    /// Mark component as unhealthy
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Set readiness status
    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    /// Get health response
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Get readiness response
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Manager not yet initialized".to_string()),
            };
        }

        let unhealthy: Vec<&String> = health
            .components
            .iter()
            .filter(|(_, h)| !h.status.is_operational())
            .map(|(name, _)| name)
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            let mut names: Vec<&str> = unhealthy.iter().map(|s| s.as_str()).collect();
            names.sort_unstable();
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", names.join(", "))),
            }
        }
    }
}

/// Turns a stream of store call results into the `store` component status.
///
/// The component goes unhealthy after `threshold` consecutive failures and
/// healthy again on the first success.
#[derive(Debug)]
pub struct StoreHealth {
    registry: HealthRegistry,
    threshold: u32,
    consecutive_failures: AtomicU32,
}

impl StoreHealth {
    pub fn new(registry: HealthRegistry, threshold: u32) -> Self {
        Self {
            registry,
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub async fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.threshold {
            info!(failures = previous, "Store reachable again");
            self.registry.set_healthy(components::STORE).await;
        }
    }

    pub async fn record_failure(&self, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.threshold {
            warn!(failures = failures, error = %error, "Store marked unhealthy");
            self.registry
                .set_unhealthy(components::STORE, format!("store unreachable: {}", error))
                .await;
        } else if failures < self.threshold {
            self.registry
                .set_degraded(components::STORE, error.to_string())
                .await;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_health_registry_degraded_status() {
        let registry = HealthRegistry::new();
        registry.register(components::SCHEDULER).await;
        registry.register(components::AGENT_MONITOR).await;

        registry.set_degraded(components::SCHEDULER, "Queue backing up").await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_component() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::STORE, "etcd down").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Unhealthy components: store"));
    }

    #[tokio::test]
    async fn test_store_health_threshold_and_recovery() {
        let registry = HealthRegistry::new();
        registry.register(components::STORE).await;
        registry.set_ready(true).await;
        let store = StoreHealth::new(registry.clone(), 3);

        store.record_failure("timeout").await;
        store.record_failure("timeout").await;
        assert_eq!(
            registry.status_of(components::STORE).await,
            Some(ComponentStatus::Degraded)
        );
        assert!(registry.readiness().await.ready);

        store.record_failure("timeout").await;
        assert!(!registry.readiness().await.ready);

        store.record_success().await;
        assert_eq!(store.consecutive_failures(), 0);
        assert!(registry.readiness().await.ready);
    }
}
