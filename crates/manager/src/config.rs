//! Service configuration

use anyhow::{Context, Result};
use manager_lib::{
    monitor::MonitorConfig, scheduler::SchedulerConfig, AgentClientConfig, ManagerConfig,
    OwnershipPolicy,
};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "FLEET_CONFIG_FILE";

/// Where the manager keeps its records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process memory, single replica
    #[default]
    Memory,
    /// Key-value store with versioned writes and leases.
    ///
    /// The binary backs this with a store private to the process, so replicas
    /// in separate processes do not share state. It exercises the same code
    /// paths a shared store would.
    Kv,
}

/// Manager service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Replica identity, also the owner of distributed leases
    #[serde(default = "default_manager_id")]
    pub manager_id: String,

    /// Address of the HTTP API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub ownership_policy: OwnershipPolicy,

    /// Record commands instead of sending them to agents
    #[serde(default)]
    pub dry_run: bool,

    /// JSON file with the desired instance set; the desired-state monitor is off without it
    #[serde(default)]
    pub desired_state_file: Option<String>,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_instance_heartbeat_timeout")]
    pub instance_heartbeat_timeout_secs: u64,
    #[serde(default = "default_pushed_timeout")]
    pub pushed_timeout_secs: u64,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_killing_timeout")]
    pub killing_timeout_secs: u64,
    #[serde(default = "default_agent_heartbeat_timeout")]
    pub agent_heartbeat_timeout_secs: u64,
    #[serde(default = "default_instance_interval")]
    pub instance_interval_secs: u64,
    #[serde(default = "default_desired_interval")]
    pub desired_interval_secs: u64,
    #[serde(default = "default_agent_interval")]
    pub agent_interval_secs: u64,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_store_failure_threshold")]
    pub store_failure_threshold: u32,
    #[serde(default = "default_cas_attempts")]
    pub cas_attempts: usize,

    /// Agent gRPC port used when an agent registers a bare address
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default = "default_agent_connect_timeout")]
    pub agent_connect_timeout_secs: u64,
    #[serde(default = "default_agent_request_timeout")]
    pub agent_request_timeout_secs: u64,
}

fn default_manager_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "manager-0".to_string())
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_push_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60
}

fn default_instance_heartbeat_timeout() -> u64 {
    30
}

fn default_pushed_timeout() -> u64 {
    60
}

fn default_pending_timeout() -> u64 {
    60
}

fn default_killing_timeout() -> u64 {
    120
}

fn default_agent_heartbeat_timeout() -> u64 {
    60
}

fn default_instance_interval() -> u64 {
    10
}

fn default_desired_interval() -> u64 {
    30
}

fn default_agent_interval() -> u64 {
    10
}

fn default_store_timeout() -> u64 {
    3
}

fn default_lock_timeout() -> u64 {
    5
}

fn default_lease_ttl() -> u64 {
    15
}

fn default_store_failure_threshold() -> u32 {
    3
}

fn default_cas_attempts() -> usize {
    16
}

fn default_agent_port() -> u16 {
    7070
}

fn default_agent_connect_timeout() -> u64 {
    3
}

fn default_agent_request_timeout() -> u64 {
    5
}

impl ServiceConfig {
    /// Load configuration from an optional file and `FLEET_*` environment variables
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("FLEET").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        let parsed: Self = config
            .try_deserialize()
            .context("Invalid manager configuration")?;
        if parsed.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        Ok(parsed)
    }

    /// Startup warning for backends whose state stays inside this process
    pub fn backend_notice(&self) -> Option<&'static str> {
        match self.backend {
            Backend::Memory => None,
            Backend::Kv => Some(
                "KV backend uses an in-process store; state is not shared with other manager processes",
            ),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            manager_id: self.manager_id.clone(),
            scheduler: SchedulerConfig {
                queue_capacity: self.queue_capacity,
                push_timeout: Duration::from_secs(self.push_timeout_secs),
                max_retries: self.max_retries,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_secs(self.max_backoff_secs),
            },
            monitors: MonitorConfig {
                instance_heartbeat_timeout: Duration::from_secs(
                    self.instance_heartbeat_timeout_secs,
                ),
                pushed_timeout: Duration::from_secs(self.pushed_timeout_secs),
                pending_timeout: Duration::from_secs(self.pending_timeout_secs),
                killing_timeout: Duration::from_secs(self.killing_timeout_secs),
                agent_heartbeat_timeout: Duration::from_secs(self.agent_heartbeat_timeout_secs),
                instance_interval: Duration::from_secs(self.instance_interval_secs),
                desired_interval: Duration::from_secs(self.desired_interval_secs),
                agent_interval: Duration::from_secs(self.agent_interval_secs),
            },
            ownership_policy: self.ownership_policy,
            store_failure_threshold: self.store_failure_threshold,
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            cas_attempts: self.cas_attempts,
        }
    }

    pub fn agent_client_config(&self) -> AgentClientConfig {
        AgentClientConfig {
            default_port: self.agent_port,
            connect_timeout: Duration::from_secs(self.agent_connect_timeout_secs),
            request_timeout: Duration::from_secs(self.agent_request_timeout_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(overrides: &[(&str, &str)]) -> Result<ServiceConfig> {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        ServiceConfig::from_config(builder.build()?)
    }

    #[test]
    fn test_defaults_match_library() {
        let config = parse(&[]).unwrap();
        let manager = config.manager_config();
        let defaults = ManagerConfig::default();

        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.backend_notice(), None);
        assert!(!config.dry_run);
        assert_eq!(manager.ownership_policy, OwnershipPolicy::Reject);
        assert_eq!(manager.scheduler.queue_capacity, defaults.scheduler.queue_capacity);
        assert_eq!(manager.scheduler.initial_backoff, defaults.scheduler.initial_backoff);
        assert_eq!(manager.scheduler.max_backoff, defaults.scheduler.max_backoff);
        assert_eq!(
            manager.monitors.killing_timeout,
            defaults.monitors.killing_timeout
        );
        assert_eq!(
            manager.monitors.pending_timeout,
            defaults.monitors.pending_timeout
        );
        assert_eq!(manager.lease_ttl, defaults.lease_ttl);
        assert_eq!(config.agent_client_config().default_port, 7070);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            ("backend", "kv"),
            ("ownership_policy", "evict_stale"),
            ("dry_run", "true"),
            ("max_retries", "2"),
            ("desired_state_file", "/etc/fleet/desired.json"),
        ])
        .unwrap();

        assert_eq!(config.backend, Backend::Kv);
        assert!(config.backend_notice().unwrap().contains("in-process"));
        assert!(config.dry_run);
        assert_eq!(config.max_retries, 2);
        assert_eq!(
            config.manager_config().ownership_policy,
            OwnershipPolicy::EvictStale
        );
        assert_eq!(
            config.desired_state_file.as_deref(),
            Some("/etc/fleet/desired.json")
        );
    }

    #[test]
    fn test_rejects_empty_queue() {
        assert!(parse(&[("queue_capacity", "0")]).is_err());
    }
}
