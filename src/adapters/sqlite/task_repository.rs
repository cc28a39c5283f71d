//! SQLite implementation of the TaskRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskPriority, TaskStatus};
use crate::domain::ports::{TaskFilter, TaskRepository, TransitionFields, TransitionRecord};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_dependencies(&self, task: &mut Task) -> DomainResult<()> {
        let deps: Vec<(String,)> =
            sqlx::query_as("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?")
                .bind(task.id.to_string())
                .fetch_all(&self.pool)
                .await?;

        task.depends_on = deps
            .iter()
            .map(|(id,)| parse_uuid(id))
            .collect::<DomainResult<_>>()?;
        Ok(())
    }

    async fn hydrate(&self, rows: Vec<TaskRow>) -> DomainResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            self.load_dependencies(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

/// Extra columns written by a transition into `to`.
fn transition_assignments(to: TaskStatus) -> &'static str {
    match to {
        TaskStatus::InProgress => {
            ", started_at = ?, assigned_agent_id = COALESCE(?, assigned_agent_id)"
        }
        TaskStatus::Completed => ", completed_at = ?",
        TaskStatus::Failed | TaskStatus::Blocked => ", last_error = COALESCE(?, last_error)",
        TaskStatus::Pending => {
            ", assigned_agent_id = NULL, started_at = NULL, completed_at = NULL"
        }
        TaskStatus::ReadyForQa => "",
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert(&self, task: &Task) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"INSERT INTO tasks (id, display_id, title, description, status, priority,
               assigned_agent_id, retry_count, last_error, created_at, updated_at,
               started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(&task.display_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.assigned_agent_id.map(|id| id.to_string()))
        .bind(i64::from(task.retry_count))
        .bind(&task.last_error)
        .bind(format_datetime(task.created_at))
        .bind(format_datetime(task.updated_at))
        .bind(task.started_at.map(format_datetime))
        .bind(task.completed_at.map(format_datetime))
        .execute(&mut *tx)
        .await?;

        for dep_id in &task.depends_on {
            sqlx::query(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?, ?)",
            )
            .bind(task.id.to_string())
            .bind(dep_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let mut task = r.try_into()?;
                self.load_dependencies(&mut task).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(agent_id) = filter.assigned_agent_id {
            query.push_str(" AND assigned_agent_id = ?");
            bindings.push(agent_id.to_string());
        }

        query.push_str(" ORDER BY created_at ASC, rowid ASC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows = q.fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>> {
        self.list(TaskFilter {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    async fn get_dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"SELECT t.* FROM tasks t
               INNER JOIN task_dependencies d ON t.id = d.depends_on_id
               WHERE d.task_id = ?
               ORDER BY t.created_at ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: &TransitionFields,
    ) -> DomainResult<Option<Task>> {
        let at = format_datetime(fields.at);
        let sql = format!(
            "UPDATE tasks SET status = ?, updated_at = ?{} WHERE id = ? AND status = ?",
            transition_assignments(to)
        );

        let mut tx = self.pool.begin().await?;

        let mut q = sqlx::query(&sql).bind(to.as_str()).bind(&at);
        q = match to {
            TaskStatus::InProgress => q
                .bind(&at)
                .bind(fields.agent_id.map(|a| a.to_string())),
            TaskStatus::Completed => q.bind(&at),
            TaskStatus::Failed | TaskStatus::Blocked => q.bind(&fields.error),
            TaskStatus::Pending | TaskStatus::ReadyForQa => q,
        };
        let result = q
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r"INSERT INTO task_transitions (task_id, from_status, to_status, source, error,
               agent_id, session_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&fields.source)
        .bind(&fields.error)
        .bind(fields.agent_id.map(|a| a.to_string()))
        .bind(fields.session_id.map(|s| s.to_string()))
        .bind(&at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get(id).await
    }

    async fn increment_retry_count(&self, id: Uuid) -> DomainResult<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ? WHERE id = ? RETURNING retry_count",
        )
        .bind(format_datetime(Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let (count,) = row.ok_or(DomainError::TaskNotFound(id))?;
        u32::try_from(count).map_err(|e| DomainError::SerializationError(e.to_string()))
    }

    async fn transition_history(&self, task_id: Uuid) -> DomainResult<Vec<TransitionRecord>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r"SELECT task_id, from_status, to_status, source, error, agent_id, session_id, created_at
               FROM task_transitions WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    display_id: String,
    title: String,
    description: String,
    status: String,
    priority: String,
    assigned_agent_id: Option<String>,
    retry_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn parse_status(s: &str) -> DomainResult<TaskStatus> {
    TaskStatus::from_str(s)
        .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {s}")))
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let priority = TaskPriority::from_str(&row.priority).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid priority: {}", row.priority))
        })?;

        Ok(Task {
            id: parse_uuid(&row.id)?,
            display_id: row.display_id,
            title: row.title,
            description: row.description,
            status: parse_status(&row.status)?,
            priority,
            assigned_agent_id: parse_optional_uuid(row.assigned_agent_id)?,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?,
            depends_on: Vec::new(),
            last_error: row.last_error,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    task_id: String,
    from_status: String,
    to_status: String,
    source: String,
    error: Option<String>,
    agent_id: Option<String>,
    session_id: Option<String>,
    created_at: String,
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = DomainError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(TransitionRecord {
            task_id: parse_uuid(&row.task_id)?,
            from_status: parse_status(&row.from_status)?,
            to_status: parse_status(&row.to_status)?,
            source: row.source,
            error: row.error,
            agent_id: parse_optional_uuid(row.agent_id)?,
            session_id: parse_optional_uuid(row.session_id)?,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup() -> SqliteTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    fn fields(source: &str) -> TransitionFields {
        TransitionFields {
            error: None,
            agent_id: None,
            session_id: None,
            source: source.to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_with_dependencies() {
        let repo = setup().await;
        let dep = Task::with_title("Dep", "first");
        repo.insert(&dep).await.unwrap();
        let task = Task::with_title("Main", "second").with_dependency(dep.id);
        repo.insert(&task).await.unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Main");
        assert_eq!(loaded.depends_on, vec![dep.id]);

        let deps = repo.get_dependencies(task.id).await.unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, dep.id);
    }

    #[tokio::test]
    async fn test_guarded_transition_misses_on_stale_status() {
        let repo = setup().await;
        let task = Task::with_title("T", "");
        repo.insert(&task).await.unwrap();

        let miss = repo
            .apply_transition(task.id, TaskStatus::ReadyForQa, TaskStatus::Completed, &fields("qa"))
            .await
            .unwrap();
        assert!(miss.is_none());

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(repo.transition_history(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_stamps_fields_and_records_history() {
        let repo = setup().await;
        let task = Task::with_title("T", "");
        repo.insert(&task).await.unwrap();
        let agent_id = Uuid::new_v4();

        let mut start = fields("spawn");
        start.agent_id = Some(agent_id);
        let started = repo
            .apply_transition(task.id, TaskStatus::Pending, TaskStatus::InProgress, &start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.status, TaskStatus::InProgress);
        assert_eq!(started.assigned_agent_id, Some(agent_id));
        assert!(started.started_at.is_some());

        let mut fail = fields("stuck_agent");
        fail.error = Some("agent stuck".to_string());
        let failed = repo
            .apply_transition(task.id, TaskStatus::InProgress, TaskStatus::Failed, &fail)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("agent stuck"));

        let pending = repo
            .apply_transition(task.id, TaskStatus::Failed, TaskStatus::Pending, &fields("retry"))
            .await
            .unwrap()
            .unwrap();
        assert!(pending.assigned_agent_id.is_none());
        assert!(pending.started_at.is_none());

        let history = repo.transition_history(task.id).await.unwrap();
        let path: Vec<_> = history.iter().map(|r| (r.from_status, r.to_status)).collect();
        assert_eq!(
            path,
            vec![
                (TaskStatus::Pending, TaskStatus::InProgress),
                (TaskStatus::InProgress, TaskStatus::Failed),
                (TaskStatus::Failed, TaskStatus::Pending),
            ]
        );
        assert_eq!(history[1].source, "stuck_agent");
    }

    #[tokio::test]
    async fn test_increment_retry_count() {
        let repo = setup().await;
        let task = Task::with_title("T", "");
        repo.insert(&task).await.unwrap();

        assert_eq!(repo.increment_retry_count(task.id).await.unwrap(), 1);
        assert_eq!(repo.increment_retry_count(task.id).await.unwrap(), 2);
        assert!(matches!(
            repo.increment_retry_count(Uuid::new_v4()).await,
            Err(DomainError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let repo = setup().await;
        let a = Task::with_title("A", "");
        let b = Task::with_title("B", "");
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();
        repo.apply_transition(a.id, TaskStatus::Pending, TaskStatus::InProgress, &fields("spawn"))
            .await
            .unwrap();

        let pending = repo.list_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        let all = repo.list(TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
