//! Core data models for the fleet manager

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a plugin instance: instance id plus version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub instance_id: String,
    pub version: String,
}

impl InstanceKey {
    pub fn new(instance_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            version: version.into(),
        }
    }

    /// Key used for this instance inside record stores.
    ///
    /// Both parts are escaped (`%` as `%25`, `/` as `%2F`) so the single
    /// unescaped `/` separates them and distinct keys never collide.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", escape(&self.instance_id), escape(&self.version))
    }

    /// Inverse of [`InstanceKey::storage_key`]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (instance_id, version) = key.split_once('/')?;
        let instance_id = unescape(instance_id)?;
        let version = unescape(version)?;
        if instance_id.is_empty() {
            return None;
        }
        Some(Self::new(instance_id, version))
    }
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        match c {
            '/' => return None,
            '%' => {}
            c => {
                out.push(c);
                continue;
            }
        }
        match (chars.next(), chars.next()) {
            (Some('2'), Some('5')) => out.push('%'),
            (Some('2'), Some('F')) => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_id, self.version)
    }
}

/// Resource metrics reported by an agent for its host
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetric {
    pub cpu: f64,
    pub memory: f64,
    pub usage_cpu: f64,
    pub usage_memory: f64,
    /// Unix milliseconds
    #[serde(default)]
    pub last_timestamp: i64,
}

/// A worker process hosting plugin instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub agent_ip: String,
    #[serde(default)]
    pub metric: AgentMetric,
    #[serde(default)]
    pub running_instances: Vec<InstanceKey>,
    pub registered_at: i64,
    /// Last heartbeat, Unix milliseconds
    pub last_timestamp: i64,
}

/// Lifecycle status of a plugin runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Pending,
    Pushed,
    Running,
    Killing,
}

impl RuntimeStatus {
    /// Statuses that count as an assignment on the owning agent
    pub fn is_assigned(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Pending | RuntimeStatus::Pushed | RuntimeStatus::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Pending => "pending",
            RuntimeStatus::Pushed => "pushed",
            RuntimeStatus::Running => "running",
            RuntimeStatus::Killing => "killing",
        }
    }

    pub const ALL: [RuntimeStatus; 4] = [
        RuntimeStatus::Pending,
        RuntimeStatus::Pushed,
        RuntimeStatus::Running,
        RuntimeStatus::Killing,
    ];
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement and lifecycle state of one plugin instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRuntime {
    pub instance_id: String,
    pub version: String,
    pub status: RuntimeStatus,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub agent_ip: String,
    /// Store version of the record this value was read from; filled in on read
    #[serde(default)]
    pub resource_version: u64,
    /// Last confirmed heartbeat or transition, Unix milliseconds
    pub last_timestamp: i64,
}

impl PluginRuntime {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.instance_id, &self.version)
    }

    pub fn is_owned_by(&self, agent_id: &str) -> bool {
        !self.agent_id.is_empty() && self.agent_id == agent_id
    }
}

/// Peak resource usage observed for a plugin instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetric {
    pub cpu: f64,
    pub cpu_time: i64,
    pub memory: f64,
    pub memory_time: i64,
}

/// Per-instance sample carried in an agent report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSample {
    pub cpu: f64,
    pub memory: f64,
    /// Unix milliseconds; the report time is used when absent
    #[serde(default)]
    pub observed_at: Option<i64>,
}

/// Action requested by a schedule task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Start,
    Stop,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Start => f.write_str("start"),
            TaskAction::Stop => f.write_str("stop"),
        }
    }
}

/// Start or stop intent consumed by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub instance_id: String,
    pub version: String,
    pub action: TaskAction,
    #[serde(default)]
    pub retry_count: u32,
}

impl ScheduleTask {
    pub fn start(key: &InstanceKey) -> Self {
        Self::new(key, TaskAction::Start)
    }

    pub fn stop(key: &InstanceKey) -> Self {
        Self::new(key, TaskAction::Stop)
    }

    fn new(key: &InstanceKey, action: TaskAction) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            version: key.version.clone(),
            action,
            retry_count: 0,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.instance_id, &self.version)
    }

    /// Same task with the retry counter bumped
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Heartbeat and state snapshot sent by an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub agent_ip: String,
    #[serde(default)]
    pub running_instances: Vec<InstanceKey>,
    #[serde(default)]
    pub metric: AgentMetric,
    /// Keyed by [`InstanceKey::storage_key`]
    #[serde(default)]
    pub instance_metrics: std::collections::HashMap<String, InstanceSample>,
}

/// Summary of what a report changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub accepted: bool,
    pub adopted: usize,
    pub confirmed: usize,
    pub removed: usize,
    pub conflicts: usize,
    pub tasks_pushed: usize,
}

impl ReportOutcome {
    pub fn rejected() -> Self {
        Self::default()
    }
}
