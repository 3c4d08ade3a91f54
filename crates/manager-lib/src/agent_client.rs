//! Outbound commands to agents
//!
//! The scheduler talks to agents through [`AgentCommander`]. Production uses
//! [`GrpcAgentClient`], which keeps one lazily connected tonic channel per
//! agent and drops it whenever a call fails so the next call reconnects.

use crate::models::{InstanceKey, PluginRuntime};
use crate::proto::{AgentControlClient, InstanceCommand};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid agent endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("agent call failed: {0}")]
    Transport(String),

    #[error("agent rejected command: {0}")]
    Rejected(String),
}

/// Start/stop commands sent to the agent named in a runtime record
#[async_trait]
pub trait AgentCommander: Send + Sync {
    async fn start_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError>;

    async fn stop_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError>;

    /// Drop any per-agent state, called when an agent leaves the fleet
    fn forget(&self, _agent_id: &str) {}
}

/// Configuration for the gRPC agent client
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    /// Port used when an agent address carries none
    pub default_port: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
    /// Keepalive interval
    pub keepalive_interval: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            default_port: 7070,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// gRPC client for the `fleet.agent.v1.AgentControl` service
pub struct GrpcAgentClient {
    config: AgentClientConfig,
    /// agent id -> (endpoint, channel)
    channels: DashMap<String, (String, Channel)>,
}

impl GrpcAgentClient {
    pub fn new(config: AgentClientConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    /// Endpoint URL for an agent address (`ip`, `ip:port` or a full URL)
    pub fn endpoint_for(&self, agent_ip: &str) -> String {
        if agent_ip.contains("://") {
            agent_ip.to_string()
        } else if agent_ip.contains(':') {
            format!("http://{}", agent_ip)
        } else {
            format!("http://{}:{}", agent_ip, self.config.default_port)
        }
    }

    pub fn has_channel(&self, agent_id: &str) -> bool {
        self.channels.contains_key(agent_id)
    }

    fn channel(&self, runtime: &PluginRuntime) -> Result<Channel, CommandError> {
        let endpoint = self.endpoint_for(&runtime.agent_ip);
        if let Some(cached) = self.channels.get(&runtime.agent_id) {
            if cached.0 == endpoint {
                return Ok(cached.1.clone());
            }
        }

        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| CommandError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_while_idle(true)
            .connect_lazy();

        debug!(agent_id = %runtime.agent_id, endpoint = %endpoint, "Created agent channel");
        self.channels
            .insert(runtime.agent_id.clone(), (endpoint, channel.clone()));
        Ok(channel)
    }

    fn command(runtime: &PluginRuntime) -> InstanceCommand {
        InstanceCommand {
            instance_id: runtime.instance_id.clone(),
            version: runtime.version.clone(),
            agent_id: runtime.agent_id.clone(),
        }
    }

    async fn call(&self, runtime: &PluginRuntime, start: bool) -> Result<(), CommandError> {
        let mut client = AgentControlClient::new(self.channel(runtime)?);
        let request = tonic::Request::new(Self::command(runtime));
        let result = if start {
            client.start_instance(request).await
        } else {
            client.stop_instance(request).await
        };

        match result {
            Ok(response) => {
                let ack = response.into_inner();
                if ack.accepted {
                    Ok(())
                } else {
                    Err(CommandError::Rejected(ack.message))
                }
            }
            Err(status) => {
                warn!(
                    agent_id = %runtime.agent_id,
                    code = ?status.code(),
                    error = %status.message(),
                    "Agent call failed, dropping channel"
                );
                self.channels.remove(&runtime.agent_id);
                Err(CommandError::Transport(status.to_string()))
            }
        }
    }
}

#[async_trait]
impl AgentCommander for GrpcAgentClient {
    async fn start_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError> {
        self.call(runtime, true).await
    }

    async fn stop_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError> {
        self.call(runtime, false).await
    }

    fn forget(&self, agent_id: &str) {
        self.channels.remove(agent_id);
    }
}

/// A command recorded by [`RecordingCommander`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub start: bool,
    pub agent_id: String,
    pub key: InstanceKey,
}

/// Commander that records commands instead of sending them.
///
/// Backs the manager's dry-run mode and lets tests make specific agents fail.
#[derive(Default)]
pub struct RecordingCommander {
    sent: Mutex<Vec<SentCommand>>,
    failing: DashMap<String, ()>,
}

impl RecordingCommander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command to `agent_id` fail until [`RecordingCommander::recover`]
    pub fn fail_agent(&self, agent_id: &str) {
        self.failing.insert(agent_id.to_string(), ());
    }

    pub fn recover(&self, agent_id: &str) {
        self.failing.remove(agent_id);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn starts(&self) -> Vec<SentCommand> {
        self.sent().into_iter().filter(|c| c.start).collect()
    }

    pub fn stops(&self) -> Vec<SentCommand> {
        self.sent().into_iter().filter(|c| !c.start).collect()
    }

    fn record(&self, runtime: &PluginRuntime, start: bool) -> Result<(), CommandError> {
        if self.failing.contains_key(&runtime.agent_id) {
            return Err(CommandError::Transport(format!(
                "agent {} unreachable",
                runtime.agent_id
            )));
        }
        let command = SentCommand {
            start,
            agent_id: runtime.agent_id.clone(),
            key: runtime.key(),
        };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(command),
            Err(poisoned) => poisoned.into_inner().push(command),
        }
        Ok(())
    }
}

#[async_trait]
impl AgentCommander for RecordingCommander {
    async fn start_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError> {
        self.record(runtime, true)
    }

    async fn stop_instance(&self, runtime: &PluginRuntime) -> Result<(), CommandError> {
        self.record(runtime, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuntimeStatus;

    fn runtime(agent_ip: &str) -> PluginRuntime {
        PluginRuntime {
            instance_id: "p1".into(),
            version: "1".into(),
            status: RuntimeStatus::Pending,
            agent_id: "a1".into(),
            agent_ip: agent_ip.into(),
            resource_version: 0,
            last_timestamp: 0,
        }
    }

    #[test]
    fn test_endpoint_for_agent_addresses() {
        let client = GrpcAgentClient::new(AgentClientConfig::default());
        assert_eq!(client.endpoint_for("10.0.0.1"), "http://10.0.0.1:7070");
        assert_eq!(client.endpoint_for("10.0.0.1:9000"), "http://10.0.0.1:9000");
        assert_eq!(
            client.endpoint_for("https://agent.internal:443"),
            "https://agent.internal:443"
        );
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails_and_drops_channel() {
        let client = GrpcAgentClient::new(AgentClientConfig {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        });

        let result = client.start_instance(&runtime("127.0.0.1:1")).await;
        assert!(matches!(result, Err(CommandError::Transport(_))));
        assert!(!client.has_channel("a1"));
    }

    #[tokio::test]
    async fn test_channel_rebuilt_when_agent_moves() {
        let client = GrpcAgentClient::new(AgentClientConfig::default());
        client.channel(&runtime("10.0.0.1")).unwrap();
        client.channel(&runtime("10.0.0.2")).unwrap();

        let cached = client.channels.get("a1").unwrap();
        assert_eq!(cached.0, "http://10.0.0.2:7070");
        drop(cached);

        client.forget("a1");
        assert!(!client.has_channel("a1"));
    }

    #[tokio::test]
    async fn test_recording_commander_failures() {
        let commander = RecordingCommander::new();
        commander.fail_agent("a1");
        assert!(commander.start_instance(&runtime("x")).await.is_err());

        commander.recover("a1");
        commander.start_instance(&runtime("x")).await.unwrap();
        commander.stop_instance(&runtime("x")).await.unwrap();
        assert_eq!(commander.starts().len(), 1);
        assert_eq!(commander.stops().len(), 1);
    }
}
