//! Bounded queue of schedule tasks

use crate::error::ManagerError;
use crate::models::ScheduleTask;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

/// Create a queue holding at most `capacity` tasks
pub fn task_queue(capacity: usize, push_timeout: Duration) -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TaskSender { tx, push_timeout }, TaskReceiver { rx })
}

/// Producer side, cloned into the manager, the monitors and retry timers
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: mpsc::Sender<ScheduleTask>,
    push_timeout: Duration,
}

impl TaskSender {
    /// Enqueue a task, waiting at most the push timeout for room
    pub async fn push(&self, task: ScheduleTask) -> Result<(), ManagerError> {
        self.tx
            .send_timeout(task, self.push_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ManagerError::QueueFull,
                SendTimeoutError::Closed(_) => ManagerError::QueueClosed,
            })
    }

    /// Tasks currently waiting
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Consumer side, owned by the scheduler loop
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::Receiver<ScheduleTask>,
}

impl TaskReceiver {
    pub async fn recv(&mut self) -> Option<ScheduleTask> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ScheduleTask> {
        self.rx.try_recv().ok()
    }
}
