//! Task scheduler
//!
//! A single consumer drains the task queue and drives runtime records through
//! their lifecycle:
//! - start: absent -> pending (CAS winner only) -> StartInstance -> pushed
//! - stop: pushed/running -> killing -> StopInstance
//!
//! Failed tasks are requeued on a backoff timer until they exceed the retry
//! ceiling, then dropped.

mod placement;
mod queue;


pub use placement::least_loaded;
pub use queue::{task_queue, TaskReceiver, TaskSender};

use crate::error::StoreError;
use crate::health::components;
use crate::models::{PluginRuntime, RuntimeStatus, ScheduleTask, TaskAction};
use crate::state::SharedState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue capacity (default: 1024)
    pub queue_capacity: usize,
    /// How long a push may wait for room (default: 5 seconds)
    pub push_timeout: Duration,
    /// Highest retry count still processed (default: 5)
    pub max_retries: u32,
    /// Delay before the first retry (default: 1 second)
    pub initial_backoff: Duration,
    /// Upper bound on retry delay (default: 60 seconds)
    pub max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            push_timeout: Duration::from_secs(5),
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    /// Delay before processing a task for the `retry_count`-th time
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What processing a task did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Instance pushed to this agent
    Placed { agent_id: String },
    /// A live record already exists, nothing to do
    AlreadyScheduled,
    /// Record moved to killing and the owner was told to stop
    Stopping,
    /// Pending record removed before it was pushed
    Removed,
    /// Nothing to stop
    NoOp,
    /// Will be retried after `delay`
    Requeued { delay: Duration },
    /// Gave up after too many retries
    Dropped,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Placed { .. } => "placed",
            TaskOutcome::AlreadyScheduled => "already_scheduled",
            TaskOutcome::Stopping => "stopping",
            TaskOutcome::Removed => "removed",
            TaskOutcome::NoOp => "noop",
            TaskOutcome::Requeued { .. } => "requeued",
            TaskOutcome::Dropped => "dropped",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Consumer of the task queue
pub struct Scheduler {
    state: SharedState,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(state: SharedState, config: SchedulerConfig) -> Self {
        Self { state, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drain the queue until shutdown or until every sender is gone
    pub async fn run(
        self: Arc<Self>,
        mut receiver: TaskReceiver,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            max_retries = self.config.max_retries,
            queue_capacity = self.config.queue_capacity,
            "Starting scheduler"
        );
        self.state.health.set_healthy(components::SCHEDULER).await;

        loop {
            tokio::select! {
                task = receiver.recv() => {
                    let Some(task) = task else {
                        warn!("Task queue closed, stopping scheduler");
                        break;
                    };
                    self.state.metrics.set_queue_depth(self.state.tasks.depth());
                    self.process_task(task).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scheduler");
                    break;
                }
            }
        }

        self.state
            .health
            .set_unhealthy(components::SCHEDULER, "scheduler stopped")
            .await;
    }

    /// Process one task. Store failures turn into a retry, never an error.
    pub async fn process_task(&self, task: ScheduleTask) -> TaskOutcome {
        let started = Instant::now();
        let result = match task.action {
            TaskAction::Start => self.start(&task).await,
            TaskAction::Stop => self.stop(&task).await,
        };

        let outcome = match self.state.track(result).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    instance = %task.key(),
                    action = %task.action,
                    error = %e,
                    "Store error while processing task"
                );
                self.retry(&task, &e.to_string())
            }
        };

        self.state
            .metrics
            .observe_scheduling_latency(started.elapsed().as_secs_f64());
        self.state.metrics.inc_task_processed(&task, outcome.label());
        debug!(
            instance = %task.key(),
            action = %task.action,
            retry_count = task.retry_count,
            outcome = %outcome,
            "Task processed"
        );
        outcome
    }

    async fn start(&self, task: &ScheduleTask) -> Result<TaskOutcome, StoreError> {
        let key = task.key();
        let runtimes = &self.state.runtimes;

        for _ in 0..self.state.cas_attempts.max(1) {
            if let Some(existing) = runtimes.get(&key).await? {
                if existing.status.is_assigned() {
                    return Ok(TaskOutcome::AlreadyScheduled);
                }
                return Ok(self.retry(task, "instance is still stopping"));
            }

            // One snapshot of agents and load per placement decision
            let agents = self.state.agents.list().await?;
            let load = runtimes.load_by_agent().await?;
            let Some(agent) = least_loaded(&agents, &load) else {
                return Ok(self.retry(task, "no agent available"));
            };

            let now = self.state.clock.now_millis();
            let pending = PluginRuntime {
                instance_id: key.instance_id.clone(),
                version: key.version.clone(),
                status: RuntimeStatus::Pending,
                agent_id: agent.agent_id.clone(),
                agent_ip: agent.agent_ip.clone(),
                resource_version: 0,
                last_timestamp: now,
            };

            match runtimes.create(pending).await? {
                Some(created) => return self.push_start(task, created).await,
                None => {
                    // Someone else created the record; re-read and decide again
                    self.state.metrics.inc_cas_conflict();
                }
            }
        }

        Ok(self.retry(task, "contended runtime record"))
    }

    /// We own the pending record: send the command and settle the record
    async fn push_start(
        &self,
        task: &ScheduleTask,
        pending: PluginRuntime,
    ) -> Result<TaskOutcome, StoreError> {
        let runtimes = &self.state.runtimes;

        if let Err(e) = self.state.commander.start_instance(&pending).await {
            self.state.metrics.inc_command_failure("start");
            warn!(
                instance = %pending.key(),
                agent_id = %pending.agent_id,
                error = %e,
                "StartInstance failed, rolling back placement"
            );
            if !runtimes.delete(&pending).await? {
                debug!(instance = %pending.key(), "Pending record changed before rollback");
            }
            return Ok(self.retry(task, &e.to_string()));
        }

        let now = self.state.clock.now_millis();
        match runtimes
            .compare_and_swap_status(&pending, RuntimeStatus::Pushed, now)
            .await?
        {
            Some(_) => {}
            None => match runtimes.get(&pending.key()).await? {
                // A report already confirmed it as running
                Some(current) if current.is_owned_by(&pending.agent_id) => {}
                _ => {
                    // Stopped while the start was in flight; undo on the agent
                    info!(
                        instance = %pending.key(),
                        agent_id = %pending.agent_id,
                        "Placement withdrawn during start, stopping instance"
                    );
                    if let Err(e) = self.state.commander.stop_instance(&pending).await {
                        self.state.metrics.inc_command_failure("stop");
                        warn!(instance = %pending.key(), error = %e, "Undo stop failed");
                    }
                    return Ok(TaskOutcome::Removed);
                }
            },
        }

        self.state.metrics.inc_placement();
        info!(
            instance = %pending.key(),
            agent_id = %pending.agent_id,
            "Instance pushed to agent"
        );
        Ok(TaskOutcome::Placed {
            agent_id: pending.agent_id,
        })
    }

    async fn stop(&self, task: &ScheduleTask) -> Result<TaskOutcome, StoreError> {
        let key = task.key();
        let runtimes = &self.state.runtimes;

        for _ in 0..self.state.cas_attempts.max(1) {
            let Some(existing) = runtimes.get(&key).await? else {
                return Ok(TaskOutcome::NoOp);
            };

            let killing = match existing.status {
                RuntimeStatus::Pending => {
                    if runtimes.delete(&existing).await? {
                        return Ok(TaskOutcome::Removed);
                    }
                    self.state.metrics.inc_cas_conflict();
                    continue;
                }
                RuntimeStatus::Pushed | RuntimeStatus::Running => {
                    let now = self.state.clock.now_millis();
                    match runtimes
                        .compare_and_swap_status(&existing, RuntimeStatus::Killing, now)
                        .await?
                    {
                        Some(killing) => killing,
                        None => {
                            self.state.metrics.inc_cas_conflict();
                            continue;
                        }
                    }
                }
                // Stop is idempotent on the agent, send it again
                RuntimeStatus::Killing => existing,
            };

            return match self.state.commander.stop_instance(&killing).await {
                Ok(()) => {
                    info!(
                        instance = %killing.key(),
                        agent_id = %killing.agent_id,
                        "Stop sent to agent"
                    );
                    Ok(TaskOutcome::Stopping)
                }
                Err(e) => {
                    self.state.metrics.inc_command_failure("stop");
                    warn!(
                        instance = %killing.key(),
                        agent_id = %killing.agent_id,
                        error = %e,
                        "StopInstance failed"
                    );
                    Ok(self.retry(task, &e.to_string()))
                }
            };
        }

        Ok(self.retry(task, "contended runtime record"))
    }

    /// Requeue `task` with a bumped retry count after a backoff delay, or drop
    /// it once the ceiling is exceeded
    fn retry(&self, task: &ScheduleTask, reason: &str) -> TaskOutcome {
        let next = task.retried();
        if next.retry_count > self.config.max_retries {
            self.state.metrics.inc_task_dropped();
            self.state.logger.log_task_dropped(task, reason);
            return TaskOutcome::Dropped;
        }

        let delay = self.config.backoff(next.retry_count);
        let sender = self.state.tasks.clone();
        debug!(
            instance = %next.key(),
            retry_count = next.retry_count,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Requeueing task"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = sender.push(next.clone()).await {
                warn!(instance = %next.key(), error = %e, "Failed to requeue task");
            }
        });
        TaskOutcome::Requeued { delay }
    }
}
