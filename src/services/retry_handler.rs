//! Failed-task retry handler.
//!
//! When verification fails a task, send it back to `pending` while retries
//! remain and block it once they are spent. Failures raised by the stuck-agent
//! path are left alone; that handler performs its own second step.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{TaskStatus, TransitionSource};
use crate::domain::ports::TaskRepository;
use crate::services::event_bus::{Envelope, Event, EventBus, EventHandler, EventKind, Subscription};
use crate::services::task_state_machine::{TaskStateMachine, TransitionContext};

pub struct FailedTaskRetryHandler {
    tasks: Arc<dyn TaskRepository>,
    state_machine: Arc<TaskStateMachine>,
    max_retries: u32,
}

impl FailedTaskRetryHandler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        state_machine: Arc<TaskStateMachine>,
        max_retries: u32,
    ) -> Self {
        Self {
            tasks,
            state_machine,
            max_retries,
        }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        bus.subscribe(EventKind::TaskFailed, Arc::clone(self) as Arc<dyn EventHandler>)
    }

    /// Returns the status the task was moved to, if any.
    pub async fn retry(&self, task_id: Uuid) -> Result<Option<TaskStatus>, String> {
        // Re-fetch: another path may already have moved it.
        let task = self
            .tasks
            .get(task_id)
            .await
            .map_err(|e| format!("Failed to get task: {e}"))?
            .ok_or_else(|| format!("Task {task_id} not found"))?;
        if task.status != TaskStatus::Failed {
            debug!(task_id = %task_id, status = %task.status, "Failed task already moved on");
            return Ok(None);
        }

        let retry_count = self
            .tasks
            .increment_retry_count(task_id)
            .await
            .map_err(|e| format!("Failed to bump retry count: {e}"))?;

        let (target, ctx) = if retry_count < self.max_retries {
            (TaskStatus::Pending, TransitionContext::new(TransitionSource::Retry))
        } else {
            (
                TaskStatus::Blocked,
                TransitionContext::new(TransitionSource::Retry).with_error(format!(
                    "Retry budget exhausted after {retry_count} attempts"
                )),
            )
        };

        match self.state_machine.transition(task_id, target, ctx).await {
            Ok(_) => {
                info!(task_id = %task_id, retry_count, max_retries = self.max_retries, to = %target, "Handled failed task");
                Ok(Some(target))
            }
            Err(e) => {
                warn!(task_id = %task_id, code = e.code(), error = %e, "Retry transition rejected");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl EventHandler for FailedTaskRetryHandler {
    fn name(&self) -> &str {
        "failed_task_retry_handler"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), String> {
        if let Event::TaskFailed {
            task_id,
            source: TransitionSource::Qa,
            ..
        } = &envelope.event
        {
            self.retry(*task_id).await?;
        }
        Ok(())
    }
}
