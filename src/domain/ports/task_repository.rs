//! Task repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_agent_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Fields written alongside a status change.
#[derive(Debug, Clone)]
pub struct TransitionFields {
    pub error: Option<String>,
    pub agent_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    /// Free-text diagnostic tag naming the caller
    pub source: String,
    pub at: DateTime<Utc>,
}

/// One row of the transition audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub task_id: Uuid,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub source: String,
    pub error: Option<String>,
    pub agent_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Repository interface for Task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task together with its dependency edges.
    async fn insert(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// List tasks with optional filters, oldest first.
    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// List tasks in a given status, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>>;

    /// Tasks that `task_id` depends on.
    async fn get_dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Guarded status write. Succeeds only if the persisted status is still
    /// `from`; returns `None` when the guard did not match. Appends an audit
    /// row in the same database transaction.
    async fn apply_transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: &TransitionFields,
    ) -> DomainResult<Option<Task>>;

    /// Increment the retry counter and return the new value.
    async fn increment_retry_count(&self, id: Uuid) -> DomainResult<u32>;

    /// Audit trail for a task, oldest first.
    async fn transition_history(&self, task_id: Uuid) -> DomainResult<Vec<TransitionRecord>>;
}
