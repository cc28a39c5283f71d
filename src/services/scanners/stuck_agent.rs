use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use super::Scanner;
use crate::domain::errors::DomainResult;
use crate::domain::models::AgentStatus;
use crate::domain::ports::{AgentFilter, AgentRepository};
use crate::services::event_bus::{Event, EventBus};

/// Reports working agents whose heartbeat is older than the stall threshold.
/// Debouncing repeated reports is the handler's job.
pub struct StuckAgentScanner {
    agents: Arc<dyn AgentRepository>,
    bus: Arc<EventBus>,
    threshold: chrono::Duration,
}

impl StuckAgentScanner {
    pub fn new(agents: Arc<dyn AgentRepository>, bus: Arc<EventBus>, threshold: chrono::Duration) -> Self {
        Self {
            agents,
            bus,
            threshold,
        }
    }

    pub async fn poll_at(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let working = self
            .agents
            .list(AgentFilter {
                role: None,
                status: Some(AgentStatus::Working),
            })
            .await?;

        let mut reported = 0;
        for agent in working.into_iter().filter(|a| a.is_stale(self.threshold, now)) {
            let age = agent.heartbeat_age(now).num_seconds();
            warn!(agent_id = %agent.id, agent = %agent.name, heartbeat_age_secs = age, "Agent looks stuck");
            self.bus.publish(Event::AgentStuck {
                agent_id: agent.id,
                reason: format!("No heartbeat for {age}s"),
            });
            reported += 1;
        }
        Ok(reported)
    }
}

#[async_trait]
impl Scanner for StuckAgentScanner {
    fn name(&self) -> &'static str {
        "stuck_agent"
    }

    async fn poll(&self) -> DomainResult<usize> {
        self.poll_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteAgentRepository};
    use crate::domain::models::{Agent, AgentRole};
    use crate::services::event_bus::EventKind;

    #[tokio::test]
    async fn test_only_stale_working_agents_are_reported() {
        let pool = create_migrated_test_pool().await.unwrap();
        let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool));
        let bus = Arc::new(EventBus::new());
        let scanner = StuckAgentScanner::new(
            Arc::clone(&agents),
            Arc::clone(&bus),
            chrono::Duration::seconds(600),
        );

        let working = Agent::new("busy", AgentRole::Worker);
        let idle = Agent::new("resting", AgentRole::Worker);
        agents.insert(&working).await.unwrap();
        agents.insert(&idle).await.unwrap();
        agents
            .set_status(working.id, AgentStatus::Working, None, None)
            .await
            .unwrap();

        let mut rx = bus.watch(&[EventKind::AgentStuck]);

        // Fresh heartbeat.
        assert_eq!(scanner.poll_at(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(scanner.poll_at(later).await.unwrap(), 1);
        match rx.recv().await.unwrap().event {
            Event::AgentStuck { agent_id, reason } => {
                assert_eq!(agent_id, working.id);
                assert!(reason.starts_with("No heartbeat for"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
