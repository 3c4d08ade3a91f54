//! Agent report handling

use super::{Manager, OwnershipPolicy};
use crate::coordination::resources;
use crate::error::{ManagerError, Result};
use crate::models::{
    AgentReport, InstanceKey, PluginRuntime, ReportOutcome, RuntimeStatus, ScheduleTask,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Work that has to wait until the report lock is released
#[derive(Default)]
struct FollowUp {
    stop_tasks: Vec<ScheduleTask>,
    /// Copies held by a previous owner that must be told to stop
    evicted_copies: Vec<PluginRuntime>,
}

impl Manager {
    /// Apply an agent report: refresh the agent, reconcile what it runs and
    /// record its metrics. Reports from unregistered agents are ignored.
    pub async fn report(&self, report: AgentReport) -> Result<ReportOutcome> {
        if report.agent_id.is_empty() {
            return Err(ManagerError::InvalidRequest("agent_id is required".into()));
        }
        let result = self.report_locked(&report).await;
        let result = self.observe(result).await;

        let (mut outcome, follow_up) = result?;
        outcome.tasks_pushed += self.dispatch(follow_up).await;
        Ok(outcome)
    }

    async fn report_locked(&self, report: &AgentReport) -> Result<(ReportOutcome, FollowUp)> {
        let guard = self
            .state
            .coordinator
            .acquire(&resources::agent(&report.agent_id))
            .await?;
        let result = self.apply_report(report).await;
        guard.release().await;
        result
    }

    async fn apply_report(&self, report: &AgentReport) -> Result<(ReportOutcome, FollowUp)> {
        let state = &self.state;
        let agent_id = report.agent_id.as_str();
        let mut outcome = ReportOutcome::default();
        let mut follow_up = FollowUp::default();

        let Some(agent) = state.agents.heartbeat(report).await? else {
            state.metrics.inc_report_rejected();
            debug!(agent_id = %agent_id, "Report rejected, agent was unregistered");
            return Ok((ReportOutcome::rejected(), follow_up));
        };
        outcome.accepted = true;
        state
            .metric_store
            .record_agent_metric(agent_id, agent.metric)
            .await?;

        let now = state.clock.now_millis();
        let reported: BTreeSet<InstanceKey> = report.running_instances.iter().cloned().collect();

        for key in &reported {
            self.reconcile_reported(report, key, now, &mut outcome, &mut follow_up)
                .await?;

            if let Some(sample) = report.instance_metrics.get(&key.storage_key()) {
                state
                    .metric_store
                    .record_instance_metric(
                        key,
                        sample.cpu,
                        sample.memory,
                        sample.observed_at.unwrap_or(now),
                    )
                    .await?;
            }
        }

        // Records this agent owns but no longer reports
        for runtime in state.runtimes.owned_by(agent_id).await? {
            if reported.contains(&runtime.key()) {
                continue;
            }
            match runtime.status {
                RuntimeStatus::Killing | RuntimeStatus::Running => {
                    if state.runtimes.delete(&runtime).await? {
                        debug!(
                            agent_id = %agent_id,
                            instance = %runtime.key(),
                            status = %runtime.status,
                            "Instance no longer reported, record removed"
                        );
                        outcome.removed += 1;
                    } else {
                        state.metrics.inc_cas_conflict();
                    }
                }
                // Start may still be in flight
                RuntimeStatus::Pending | RuntimeStatus::Pushed => {}
            }
        }

        Ok((outcome, follow_up))
    }

    async fn reconcile_reported(
        &self,
        report: &AgentReport,
        key: &InstanceKey,
        now: i64,
        outcome: &mut ReportOutcome,
        follow_up: &mut FollowUp,
    ) -> Result<()> {
        let state = &self.state;
        let agent_id = report.agent_id.as_str();

        for _ in 0..state.cas_attempts.max(1) {
            let Some(current) = state.runtimes.get(key).await? else {
                let adopted = PluginRuntime {
                    instance_id: key.instance_id.clone(),
                    version: key.version.clone(),
                    status: RuntimeStatus::Running,
                    agent_id: agent_id.to_string(),
                    agent_ip: report.agent_ip.clone(),
                    resource_version: 0,
                    last_timestamp: now,
                };
                if state.runtimes.create(adopted).await?.is_some() {
                    info!(agent_id = %agent_id, instance = %key, "Adopted unknown instance");
                    outcome.adopted += 1;
                    return Ok(());
                }
                state.metrics.inc_cas_conflict();
                continue;
            };

            if current.is_owned_by(agent_id) {
                if current.status == RuntimeStatus::Killing {
                    // Still running on the agent: the stop has not landed yet
                    follow_up.stop_tasks.push(ScheduleTask::stop(key));
                    return Ok(());
                }
                let confirmed = PluginRuntime {
                    status: RuntimeStatus::Running,
                    agent_ip: report.agent_ip.clone(),
                    last_timestamp: now,
                    ..current.clone()
                };
                if state.runtimes.compare_and_swap(&current, confirmed).await?.is_some() {
                    outcome.confirmed += 1;
                    return Ok(());
                }
                state.metrics.inc_cas_conflict();
                continue;
            }

            return self
                .ownership_conflict(report, current, now, outcome, follow_up)
                .await;
        }

        Err(crate::error::StoreError::Contended {
            key: key.storage_key(),
            attempts: state.cas_attempts.max(1),
        }
        .into())
    }

    async fn ownership_conflict(
        &self,
        report: &AgentReport,
        current: PluginRuntime,
        now: i64,
        outcome: &mut ReportOutcome,
        follow_up: &mut FollowUp,
    ) -> Result<()> {
        let state = &self.state;
        let policy = self.config.ownership_policy;
        let key = current.key();

        outcome.conflicts += 1;
        state.metrics.inc_ownership_conflict();
        state
            .logger
            .log_ownership_conflict(&key, &current.agent_id, &report.agent_id, policy.as_str());

        if policy == OwnershipPolicy::Reject {
            return Ok(());
        }

        let moved = PluginRuntime {
            status: RuntimeStatus::Running,
            agent_id: report.agent_id.clone(),
            agent_ip: report.agent_ip.clone(),
            last_timestamp: now,
            ..current.clone()
        };
        if state.runtimes.compare_and_swap(&current, moved).await?.is_none() {
            // Someone else changed the record; the next report re-evaluates it
            state.metrics.inc_cas_conflict();
            return Ok(());
        }

        info!(
            instance = %key,
            from = %current.agent_id,
            to = %report.agent_id,
            "Instance reassigned to reporting agent"
        );
        if policy == OwnershipPolicy::EvictStale && !current.agent_id.is_empty() {
            follow_up.evicted_copies.push(current);
        }
        Ok(())
    }

    /// Push deferred tasks and stop stale copies; runs with no lock held.
    /// Returns how many tasks were pushed.
    async fn dispatch(&self, follow_up: FollowUp) -> usize {
        let mut pushed = 0;
        for task in follow_up.stop_tasks {
            match self.push_task(task.clone()).await {
                Ok(()) => pushed += 1,
                Err(e) => warn!(instance = %task.key(), error = %e, "Failed to push stop task"),
            }
        }

        for stale in follow_up.evicted_copies {
            if let Err(e) = self.state.commander.stop_instance(&stale).await {
                self.state.metrics.inc_command_failure("stop");
                warn!(
                    instance = %stale.key(),
                    agent_id = %stale.agent_id,
                    error = %e,
                    "Failed to stop stale copy on previous owner"
                );
            }
        }
        pushed
    }
}
