//! Agent repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, AgentRole, AgentStatus};

/// Filter criteria for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub role: Option<AgentRole>,
    pub status: Option<AgentStatus>,
}

/// Repository interface for Agent persistence.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Register a new agent slot.
    async fn insert(&self, agent: &Agent) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>>;

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Agent>>;

    /// List agents, in registration order.
    async fn list(&self, filter: AgentFilter) -> DomainResult<Vec<Agent>>;

    /// Overwrite status together with the current task and session.
    async fn set_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        task_id: Option<Uuid>,
        session_id: Option<Uuid>,
    ) -> DomainResult<()>;

    /// Set the heartbeat to now.
    async fn touch_heartbeat(&self, id: Uuid) -> DomainResult<()>;

    /// Bump the completed or failed counter.
    async fn record_outcome(&self, id: Uuid, succeeded: bool) -> DomainResult<()>;
}
