use super::state::StateTracker;
use crate::source::provider::{TaskHandle, TaskStatusProvider};
use crate::source::retry::AbortCheck;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cancels the session shortly after the watched task reaches a terminal state.
pub struct Watchdog {
    tasks: Arc<dyn TaskStatusProvider>,
    task: TaskHandle,
    poll_interval: Duration,
    grace: Duration,
    token: CancellationToken,
    state: StateTracker,
    failure: Arc<Mutex<Option<String>>>,
}

impl Watchdog {
    pub fn new(
        tasks: Arc<dyn TaskStatusProvider>,
        task: TaskHandle,
        token: CancellationToken,
        state: StateTracker,
    ) -> Self {
        Self {
            tasks,
            task,
            poll_interval: Duration::from_secs(1),
            grace: Duration::from_secs(3),
            token,
            state,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, grace: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.grace = grace;
        self
    }

    /// Slot receiving the task's failure detail, if it stopped with one
    pub fn failure_slot(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.failure)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(task = %self.task.id, "Watching task status");

        loop {
            let status = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                status = self.tasks.task_terminal_status(&self.task) => status,
            };

            match status {
                Ok(status) if status.is_terminal => {
                    info!(
                        task = %self.task.id,
                        failure = status.failure_detail.as_deref().unwrap_or(""),
                        grace_ms = self.grace.as_millis() as u64,
                        "Task stopped, closing session after grace period"
                    );
                    if let Some(detail) = status.failure_detail {
                        if let Ok(mut slot) = self.failure.lock() {
                            *slot = Some(detail);
                        }
                    }
                    self.state.mark_task_stopping();

                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {}
                        _ = tokio::time::sleep(self.grace) => {}
                    }
                    self.token.cancel();
                    return;
                }
                Ok(_) => debug!(task = %self.task.id, "Task still running"),
                Err(e) => warn!(task = %self.task.id, error = %e, "Failed to get task status"),
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Stops the wait for a log group once the task that would create it is gone.
pub struct TaskAbortCheck {
    tasks: Arc<dyn TaskStatusProvider>,
    task: TaskHandle,
}

impl TaskAbortCheck {
    pub fn new(tasks: Arc<dyn TaskStatusProvider>, task: TaskHandle) -> Self {
        Self { tasks, task }
    }
}

#[async_trait]
impl AbortCheck for TaskAbortCheck {
    async fn abort_reason(&self) -> Option<String> {
        match self.tasks.task_terminal_status(&self.task).await {
            Ok(status) if status.is_terminal => Some(
                status
                    .failure_detail
                    .unwrap_or_else(|| format!("task {} stopped", self.task.id)),
            ),
            Ok(_) => None,
            Err(e) => {
                debug!(task = %self.task.id, error = %e, "Task status unavailable while waiting");
                None
            }
        }
    }
}
