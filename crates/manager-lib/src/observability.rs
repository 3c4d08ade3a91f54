//! Observability infrastructure for the fleet manager
//!
//! Provides:
//! - Prometheus metrics (task throughput, placements, conflicts, evictions, fleet size)
//! - Structured JSON logging with tracing

use crate::models::{InstanceKey, RuntimeStatus, ScheduleTask};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for scheduling latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ManagerMetricsInner> = OnceLock::new();

struct ManagerMetricsInner {
    tasks_pushed: IntCounterVec,
    tasks_processed: IntCounterVec,
    tasks_dropped: IntCounter,
    placements: IntCounter,
    command_failures: IntCounterVec,
    cas_conflicts: IntCounter,
    ownership_conflicts: IntCounter,
    agents_evicted: IntCounter,
    instances_evicted: IntCounter,
    reports_rejected: IntCounter,
    agents: IntGauge,
    runtimes: IntGaugeVec,
    queue_depth: IntGauge,
    scheduling_latency_seconds: Histogram,
}

impl ManagerMetricsInner {
    fn new() -> Self {
        Self {
            tasks_pushed: register_int_counter_vec!(
                "fleet_manager_tasks_pushed_total",
                "Schedule tasks accepted into the queue",
                &["action"]
            )
            .expect("Failed to register tasks_pushed_total"),

            tasks_processed: register_int_counter_vec!(
                "fleet_manager_tasks_processed_total",
                "Schedule tasks taken off the queue, by outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register tasks_processed_total"),

            tasks_dropped: register_int_counter!(
                "fleet_manager_tasks_dropped_total",
                "Schedule tasks dropped after exceeding the retry ceiling"
            )
            .expect("Failed to register tasks_dropped_total"),

            placements: register_int_counter!(
                "fleet_manager_placements_total",
                "Instances successfully pushed to an agent"
            )
            .expect("Failed to register placements_total"),

            command_failures: register_int_counter_vec!(
                "fleet_manager_agent_command_failures_total",
                "Failed start/stop commands sent to agents",
                &["command"]
            )
            .expect("Failed to register agent_command_failures_total"),

            cas_conflicts: register_int_counter!(
                "fleet_manager_cas_conflicts_total",
                "Compare-and-swap writes lost to a concurrent writer"
            )
            .expect("Failed to register cas_conflicts_total"),

            ownership_conflicts: register_int_counter!(
                "fleet_manager_ownership_conflicts_total",
                "Reports claiming an instance owned by another agent"
            )
            .expect("Failed to register ownership_conflicts_total"),

            agents_evicted: register_int_counter!(
                "fleet_manager_agents_evicted_total",
                "Agents removed after missing heartbeats"
            )
            .expect("Failed to register agents_evicted_total"),

            instances_evicted: register_int_counter!(
                "fleet_manager_instances_evicted_total",
                "Runtime records removed by monitors or cascades"
            )
            .expect("Failed to register instances_evicted_total"),

            reports_rejected: register_int_counter!(
                "fleet_manager_reports_rejected_total",
                "Reports ignored because the agent was unregistered"
            )
            .expect("Failed to register reports_rejected_total"),

            agents: register_int_gauge!("fleet_manager_agents", "Number of registered agents")
                .expect("Failed to register agents"),

            runtimes: register_int_gauge_vec!(
                "fleet_manager_runtimes",
                "Number of runtime records by status",
                &["status"]
            )
            .expect("Failed to register runtimes"),

            queue_depth: register_int_gauge!(
                "fleet_manager_queue_depth",
                "Schedule tasks waiting in the queue"
            )
            .expect("Failed to register queue_depth"),

            scheduling_latency_seconds: register_histogram!(
                "fleet_manager_scheduling_latency_seconds",
                "Time spent processing one schedule task",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scheduling_latency_seconds"),
        }
    }
}

/// Manager metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ManagerMetrics {
    inner: &'static ManagerMetricsInner,
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ManagerMetricsInner::new),
        }
    }

    pub fn inc_task_pushed(&self, task: &ScheduleTask) {
        self.inner
            .tasks_pushed
            .with_label_values(&[&task.action.to_string()])
            .inc();
    }

    pub fn inc_task_processed(&self, task: &ScheduleTask, outcome: &str) {
        self.inner
            .tasks_processed
            .with_label_values(&[&task.action.to_string(), outcome])
            .inc();
    }

    pub fn inc_task_dropped(&self) {
        self.inner.tasks_dropped.inc();
    }

    pub fn inc_placement(&self) {
        self.inner.placements.inc();
    }

    pub fn inc_command_failure(&self, command: &str) {
        self.inner
            .command_failures
            .with_label_values(&[command])
            .inc();
    }

    pub fn inc_cas_conflict(&self) {
        self.inner.cas_conflicts.inc();
    }

    pub fn inc_ownership_conflict(&self) {
        self.inner.ownership_conflicts.inc();
    }

    pub fn inc_agent_evicted(&self) {
        self.inner.agents_evicted.inc();
    }

    pub fn add_instances_evicted(&self, count: u64) {
        self.inner.instances_evicted.inc_by(count);
    }

    pub fn inc_report_rejected(&self) {
        self.inner.reports_rejected.inc();
    }

    pub fn set_agents(&self, count: usize) {
        self.inner.agents.set(count as i64);
    }

    pub fn set_runtimes(&self, counts: &HashMap<RuntimeStatus, usize>) {
        for status in RuntimeStatus::ALL {
            let count = counts.get(&status).copied().unwrap_or(0);
            self.inner
                .runtimes
                .with_label_values(&[status.as_str()])
                .set(count as i64);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.set(depth as i64);
    }

    pub fn observe_scheduling_latency(&self, duration_secs: f64) {
        self.inner.scheduling_latency_seconds.observe(duration_secs);
    }

    pub fn tasks_dropped(&self) -> u64 {
        self.inner.tasks_dropped.get()
    }

    pub fn ownership_conflicts(&self) -> u64 {
        self.inner.ownership_conflicts.get()
    }
}

/// Structured logger for manager events
///
/// Emits one named `event` per significant lifecycle change so log pipelines
/// can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    manager_id: String,
}

impl StructuredLogger {
    pub fn new(manager_id: impl Into<String>) -> Self {
        Self {
            manager_id: manager_id.into(),
        }
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// Log manager startup
    pub fn log_startup(&self, version: &str, backend: &str) {
        info!(
            event = "manager_started",
            manager = %self.manager_id,
            manager_version = %version,
            backend = %backend,
            "Fleet manager started"
        );
    }

    /// Log manager shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "manager_shutdown",
            manager = %self.manager_id,
            reason = %reason,
            "Fleet manager shutting down"
        );
    }

    /// Log a task given up after too many retries
    pub fn log_task_dropped(&self, task: &ScheduleTask, reason: &str) {
        warn!(
            event = "task_dropped",
            manager = %self.manager_id,
            instance_id = %task.instance_id,
            version = %task.version,
            action = %task.action,
            retry_count = task.retry_count,
            reason = %reason,
            "Schedule task dropped"
        );
    }

    /// Log an agent removed for missing heartbeats
    pub fn log_agent_evicted(&self, agent_id: &str, last_seen: i64, runtimes_removed: usize) {
        warn!(
            event = "agent_evicted",
            manager = %self.manager_id,
            agent_id = %agent_id,
            last_seen = last_seen,
            runtimes_removed = runtimes_removed,
            "Agent evicted after missed heartbeats"
        );
    }

    /// Log a report that claims an instance owned by someone else
    pub fn log_ownership_conflict(
        &self,
        key: &InstanceKey,
        owner: &str,
        claimant: &str,
        policy: &str,
    ) {
        warn!(
            event = "ownership_conflict",
            manager = %self.manager_id,
            instance = %key,
            owner = %owner,
            claimant = %claimant,
            policy = %policy,
            "Instance reported by an agent that does not own it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_metrics_creation() {
        // Metrics live in the global registry; handles share one instance
        let metrics = ManagerMetrics::new();
        let again = ManagerMetrics::new();

        let before = again.tasks_dropped();
        metrics.inc_task_dropped();
        assert!(again.tasks_dropped() > before);

        let task = ScheduleTask::start(&InstanceKey::new("p1", "1"));
        metrics.inc_task_pushed(&task);
        metrics.inc_task_processed(&task, "placed");
        metrics.set_runtimes(&HashMap::new());
        metrics.observe_scheduling_latency(0.01);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("manager-0");
        assert_eq!(logger.manager_id(), "manager-0");
    }
}
