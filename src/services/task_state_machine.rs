//! Task state machine.
//!
//! The only writer of task status. A transition is checked against the
//! legal-move table, persisted with a compare-and-swap on the current status,
//! and then announced on the bus. Racing callers linearize on the persisted
//! status: whoever writes first wins and the other is rejected.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::models::{Task, TaskStatus, TransitionSource};
use crate::domain::ports::{TaskRepository, TransitionFields};
use crate::services::event_bus::{Event, EventBus};

/// Why a transition was rejected.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] DomainError),
}

impl TransitionError {
    /// Stable code for logs and status output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TaskNotFound(_) => "task_not_found",
            Self::Store(_) => "store_error",
        }
    }
}

/// Caller-supplied context recorded with a transition.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub error: Option<String>,
    pub agent_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub source: TransitionSource,
}

impl TransitionContext {
    pub fn new(source: TransitionSource) -> Self {
        Self {
            error: None,
            agent_id: None,
            session_id: None,
            source,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

pub struct TaskStateMachine {
    tasks: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
}

impl TaskStateMachine {
    pub fn new(tasks: Arc<dyn TaskRepository>, bus: Arc<EventBus>) -> Self {
        Self { tasks, bus }
    }

    /// Pure legality check.
    pub fn is_valid(from: TaskStatus, to: TaskStatus) -> bool {
        from.can_transition_to(to)
    }

    /// Move `task_id` to `target`, returning the updated record.
    pub async fn transition(
        &self,
        task_id: Uuid,
        target: TaskStatus,
        ctx: TransitionContext,
    ) -> Result<Task, TransitionError> {
        let current = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(TransitionError::TaskNotFound(task_id))?;

        let from = current.status;
        if !Self::is_valid(from, target) {
            warn!(
                task_id = %task_id,
                from = %from,
                to = %target,
                source = %ctx.source,
                "Rejected invalid transition"
            );
            return Err(TransitionError::InvalidTransition {
                task_id,
                from,
                to: target,
            });
        }

        let fields = TransitionFields {
            error: ctx.error.clone(),
            agent_id: ctx.agent_id,
            session_id: ctx.session_id,
            source: ctx.source.as_str().to_string(),
            at: Utc::now(),
        };

        let Some(updated) = self
            .tasks
            .apply_transition(task_id, from, target, &fields)
            .await?
        else {
            // Someone else moved the task between our read and write.
            let now = self
                .tasks
                .get(task_id)
                .await?
                .ok_or(TransitionError::TaskNotFound(task_id))?;
            warn!(
                task_id = %task_id,
                expected = %from,
                actual = %now.status,
                to = %target,
                "Lost transition race"
            );
            return Err(TransitionError::InvalidTransition {
                task_id,
                from: now.status,
                to: target,
            });
        };

        debug!(
            task_id = %task_id,
            from = %from,
            to = %target,
            source = %ctx.source,
            "Task transitioned"
        );

        self.bus.publish(event_for(&updated, &ctx));
        Ok(updated)
    }
}

fn event_for(task: &Task, ctx: &TransitionContext) -> Event {
    let task_id = task.id;
    match task.status {
        TaskStatus::Pending => Event::TaskPending { task_id },
        TaskStatus::InProgress => Event::TaskStarted {
            task_id,
            agent_id: ctx.agent_id,
            session_id: ctx.session_id,
        },
        TaskStatus::ReadyForQa => Event::TaskReadyForQa { task_id },
        TaskStatus::Completed => Event::TaskCompleted { task_id },
        TaskStatus::Failed => Event::TaskFailed {
            task_id,
            error: ctx.error.clone(),
            source: ctx.source,
        },
        TaskStatus::Blocked => Event::TaskBlocked {
            task_id,
            reason: ctx.error.clone(),
            source: ctx.source,
        },
    }
}
