//! SQLite implementation of the AgentRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentRole, AgentStatus};
use crate::domain::ports::{AgentFilter, AgentRepository};

#[derive(Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn insert(&self, agent: &Agent) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO agents (id, name, role, status, current_task_id, current_session_id,
               heartbeat_at, tasks_completed, tasks_failed, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(agent.role.as_str())
        .bind(agent.status.as_str())
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(agent.current_session_id.map(|id| id.to_string()))
        .bind(format_datetime(agent.heartbeat_at))
        .bind(i64::from(agent.tasks_completed))
        .bind(i64::from(agent.tasks_failed))
        .bind(format_datetime(agent.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: AgentFilter) -> DomainResult<Vec<Agent>> {
        let mut query = String::from("SELECT * FROM agents WHERE 1=1");
        let mut bindings: Vec<&'static str> = Vec::new();

        if let Some(role) = filter.role {
            query.push_str(" AND role = ?");
            bindings.push(role.as_str());
        }
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str());
        }
        query.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut q = sqlx::query_as::<_, AgentRow>(&query);
        for binding in bindings {
            q = q.bind(binding);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        task_id: Option<Uuid>,
        session_id: Option<Uuid>,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE agents SET status = ?, current_task_id = ?, current_session_id = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(task_id.map(|t| t.to_string()))
        .bind(session_id.map(|s| s.to_string()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("UPDATE agents SET heartbeat_at = ? WHERE id = ?")
            .bind(format_datetime(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn record_outcome(&self, id: Uuid, succeeded: bool) -> DomainResult<()> {
        let sql = if succeeded {
            "UPDATE agents SET tasks_completed = tasks_completed + 1 WHERE id = ?"
        } else {
            "UPDATE agents SET tasks_failed = tasks_failed + 1 WHERE id = ?"
        };
        let result = sqlx::query(sql)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    name: String,
    role: String,
    status: String,
    current_task_id: Option<String>,
    current_session_id: Option<String>,
    heartbeat_at: String,
    tasks_completed: i64,
    tasks_failed: i64,
    created_at: String,
}

impl TryFrom<AgentRow> for Agent {
    type Error = DomainError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let role: AgentRole = row
            .role
            .parse()
            .map_err(|e: anyhow::Error| DomainError::SerializationError(e.to_string()))?;
        let status: AgentStatus = row
            .status
            .parse()
            .map_err(|e: anyhow::Error| DomainError::SerializationError(e.to_string()))?;
        let counter = |v: i64| {
            u32::try_from(v).map_err(|e| DomainError::SerializationError(e.to_string()))
        };

        Ok(Agent {
            id: parse_uuid(&row.id)?,
            name: row.name,
            role,
            status,
            current_task_id: parse_optional_uuid(row.current_task_id)?,
            current_session_id: parse_optional_uuid(row.current_session_id)?,
            heartbeat_at: parse_datetime(&row.heartbeat_at)?,
            tasks_completed: counter(row.tasks_completed)?,
            tasks_failed: counter(row.tasks_failed)?,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup() -> SqliteAgentRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteAgentRepository::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let repo = setup().await;
        let agent = Agent::new("worker-1", AgentRole::Worker);
        repo.insert(&agent).await.unwrap();

        let by_id = repo.get(agent.id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "worker-1");
        let by_name = repo.get_by_name("worker-1").await.unwrap().unwrap();
        assert_eq!(by_name.id, agent.id);
        assert!(repo.get_by_name("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_status_and_filter() {
        let repo = setup().await;
        let worker = Agent::new("worker-1", AgentRole::Worker);
        let verifier = Agent::new("qa", AgentRole::Verifier);
        repo.insert(&worker).await.unwrap();
        repo.insert(&verifier).await.unwrap();

        let task_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        repo.set_status(worker.id, AgentStatus::Working, Some(task_id), Some(session_id))
            .await
            .unwrap();

        let working = repo
            .list(AgentFilter {
                status: Some(AgentStatus::Working),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].current_task_id, Some(task_id));
        assert_eq!(working[0].current_session_id, Some(session_id));

        let verifiers = repo
            .list(AgentFilter {
                role: Some(AgentRole::Verifier),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(verifiers.len(), 1);
        assert_eq!(verifiers[0].name, "qa");
    }

    #[tokio::test]
    async fn test_unknown_agent_is_reported() {
        let repo = setup().await;
        let result = repo
            .set_status(Uuid::new_v4(), AgentStatus::Idle, None, None)
            .await;
        assert!(matches!(result, Err(DomainError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn test_record_outcome_counters() {
        let repo = setup().await;
        let agent = Agent::new("worker-1", AgentRole::Worker);
        repo.insert(&agent).await.unwrap();

        repo.record_outcome(agent.id, true).await.unwrap();
        repo.record_outcome(agent.id, true).await.unwrap();
        repo.record_outcome(agent.id, false).await.unwrap();

        let loaded = repo.get(agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.tasks_completed, 2);
        assert_eq!(loaded.tasks_failed, 1);
    }
}
