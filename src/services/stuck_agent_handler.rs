//! Stuck-agent handler.
//!
//! Resets a stalled agent and puts its task back in the backlog, or blocks
//! the task once it has stalled too often. Repeated `agent:stuck` events for
//! the same agent inside the debounce window are ignored.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::models::{AgentStatus, RecoveryConfig, TaskStatus, TransitionSource};
use crate::domain::ports::{AgentRepository, Notifier, TaskRepository};
use crate::services::event_bus::{Envelope, Event, EventBus, EventHandler, EventKind, Subscription};
use crate::services::expiring_set::ExpiringSet;
use crate::services::task_state_machine::{TaskStateMachine, TransitionContext, TransitionError};

/// What handling one stuck agent did to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckOutcome {
    /// Seen within the debounce window; nothing done
    Debounced,
    /// Agent reset; it had no task in progress
    AgentReset,
    /// Task went `in_progress -> failed -> pending`
    Requeued { retry_count: u32 },
    /// Task hit the retry ceiling and was blocked
    Blocked { retry_count: u32 },
}

pub struct StuckAgentHandler {
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    state_machine: Arc<TaskStateMachine>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    channel: String,
    retry_ceiling: u32,
    recent: ExpiringSet<Uuid>,
}

impl StuckAgentHandler {
    pub fn new(
        config: &RecoveryConfig,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        state_machine: Arc<TaskStateMachine>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            agents,
            state_machine,
            bus,
            notifier,
            channel: channel.into(),
            retry_ceiling: config.stuck_retry_ceiling,
            recent: ExpiringSet::new(Duration::from_secs(config.debounce_secs)),
        }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        bus.subscribe(EventKind::AgentStuck, Arc::clone(self) as Arc<dyn EventHandler>)
    }

    /// Agents currently inside the debounce window.
    pub fn debounced_agents(&self) -> usize {
        self.recent.len()
    }

    pub async fn handle_stuck(&self, agent_id: Uuid, reason: &str) -> Result<StuckOutcome, String> {
        if !self.recent.insert_if_absent(agent_id) {
            info!(agent_id = %agent_id, "Stuck agent already being handled; skipping");
            return Ok(StuckOutcome::Debounced);
        }

        let agent = self
            .agents
            .get(agent_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("agent {agent_id} not found"))?;

        warn!(agent_id = %agent_id, agent = %agent.name, reason = %reason, "Recovering stuck agent");

        self.agents
            .set_status(agent_id, AgentStatus::Idle, None, None)
            .await
            .map_err(|e| e.to_string())?;
        self.agents
            .touch_heartbeat(agent_id)
            .await
            .map_err(|e| e.to_string())?;

        let outcome = match agent.current_task_id {
            Some(task_id) => self.recover_task(task_id, agent_id, agent.current_session_id).await?,
            None => StuckOutcome::AgentReset,
        };

        if let Some(session_id) = agent.current_session_id {
            if let Some(task_id) = agent.current_task_id {
                self.bus.publish(Event::SessionEnded {
                    session_id,
                    task_id,
                    agent_id,
                });
            }
        }
        self.bus.publish(Event::AgentIdle { agent_id });
        Ok(outcome)
    }

    async fn recover_task(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<StuckOutcome, String> {
        let Some(task) = self.tasks.get(task_id).await.map_err(|e| e.to_string())? else {
            warn!(task_id = %task_id, "Stuck agent pointed at a missing task");
            return Ok(StuckOutcome::AgentReset);
        };
        if task.status != TaskStatus::InProgress {
            info!(task_id = %task_id, status = %task.status, "Stuck agent's task is not in progress; leaving it");
            return Ok(StuckOutcome::AgentReset);
        }

        let retry_count = self
            .tasks
            .increment_retry_count(task_id)
            .await
            .map_err(|e| e.to_string())?;

        let mut ctx = TransitionContext::new(TransitionSource::StuckAgent).with_agent(agent_id);
        if let Some(session_id) = session_id {
            ctx = ctx.with_session(session_id);
        }

        if retry_count >= self.retry_ceiling {
            let reason = format!("Agent repeatedly stale ({retry_count} stalls)");
            self.state_machine
                .transition(task_id, TaskStatus::Blocked, ctx.with_error(reason.clone()))
                .await
                .map_err(describe)?;
            warn!(task_id = %task_id, retry_count, "Task blocked after repeated stalls");

            let message = format!("Task {} blocked: {reason}", task.display_id);
            if let Err(e) = self.notifier.notify(&self.channel, &message).await {
                warn!(error = %e, "Failed to send blocked-task notification");
            }
            return Ok(StuckOutcome::Blocked { retry_count });
        }

        self.state_machine
            .transition(task_id, TaskStatus::Failed, ctx.with_error("agent stuck"))
            .await
            .map_err(describe)?;
        self.state_machine
            .transition(
                task_id,
                TaskStatus::Pending,
                TransitionContext::new(TransitionSource::Retry),
            )
            .await
            .map_err(describe)?;
        info!(task_id = %task_id, retry_count, "Requeued task from stuck agent");
        Ok(StuckOutcome::Requeued { retry_count })
    }
}

fn describe(e: TransitionError) -> String {
    format!("{}: {e}", e.code())
}

#[async_trait]
impl EventHandler for StuckAgentHandler {
    fn name(&self) -> &str {
        "stuck_agent_handler"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), String> {
        if let Event::AgentStuck { agent_id, reason } = &envelope.event {
            self.handle_stuck(*agent_id, reason).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::RecordingNotifier;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteAgentRepository, SqliteTaskRepository,
    };
    use crate::domain::models::{Agent, AgentRole, Task};

    struct Fixture {
        handler: StuckAgentHandler,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        sm: Arc<TaskStateMachine>,
        bus: Arc<EventBus>,
        notifier: RecordingNotifier,
    }

    async fn fixture() -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool));
        let bus = Arc::new(EventBus::new());
        let sm = Arc::new(TaskStateMachine::new(Arc::clone(&tasks), Arc::clone(&bus)));
        let notifier = RecordingNotifier::new();
        let handler = StuckAgentHandler::new(
            &RecoveryConfig::default(),
            Arc::clone(&tasks),
            Arc::clone(&agents),
            Arc::clone(&sm),
            Arc::clone(&bus),
            Arc::new(notifier.clone()),
            "ops",
        );
        Fixture {
            handler,
            tasks,
            agents,
            sm,
            bus,
            notifier,
        }
    }

    /// A working agent holding an in-progress task with `retries` prior stalls.
    async fn stalled(f: &Fixture, retries: u32) -> (Agent, Task) {
        let agent = Agent::new("w1", AgentRole::Worker);
        f.agents.insert(&agent).await.unwrap();
        let task = Task::with_title("slow", "");
        f.tasks.insert(&task).await.unwrap();
        for _ in 0..retries {
            f.tasks.increment_retry_count(task.id).await.unwrap();
        }
        f.sm
            .transition(
                task.id,
                TaskStatus::InProgress,
                TransitionContext::new(TransitionSource::Spawn).with_agent(agent.id),
            )
            .await
            .unwrap();
        f.agents
            .set_status(agent.id, AgentStatus::Working, Some(task.id), None)
            .await
            .unwrap();
        (agent, task)
    }

    #[tokio::test]
    async fn test_stuck_agent_task_is_requeued_through_failed() {
        let f = fixture().await;
        let (agent, task) = stalled(&f, 0).await;

        let outcome = f.handler.handle_stuck(agent.id, "no heartbeat").await.unwrap();
        assert_eq!(outcome, StuckOutcome::Requeued { retry_count: 1 });

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.assigned_agent_id.is_none());

        let path: Vec<_> = f
            .tasks
            .transition_history(task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.to_status)
            .collect();
        assert_eq!(
            path,
            vec![TaskStatus::InProgress, TaskStatus::Failed, TaskStatus::Pending]
        );

        let agent = f.agents.get(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_same_agent_twice_is_debounced() {
        let f = fixture().await;
        let (agent, task) = stalled(&f, 0).await;

        let first = f.handler.handle_stuck(agent.id, "stale").await.unwrap();
        let second = f.handler.handle_stuck(agent.id, "stale").await.unwrap();

        assert!(matches!(first, StuckOutcome::Requeued { .. }));
        assert_eq!(second, StuckOutcome::Debounced);
        assert_eq!(f.bus.published_count(EventKind::AgentIdle), 1);
        assert_eq!(f.tasks.get(task.id).await.unwrap().unwrap().retry_count, 1);
        assert_eq!(f.handler.debounced_agents(), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_blocks_task() {
        let f = fixture().await;
        let (agent, task) = stalled(&f, 4).await;

        let outcome = f.handler.handle_stuck(agent.id, "stale").await.unwrap();
        assert_eq!(outcome, StuckOutcome::Blocked { retry_count: 5 });

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Blocked);
        assert!(stored.last_error.unwrap().contains("repeatedly stale"));
        assert_eq!(f.notifier.messages().len(), 1);
        assert_eq!(f.bus.published_count(EventKind::TaskPending), 0);
    }

    #[tokio::test]
    async fn test_idle_agent_without_task_is_only_reset() {
        let f = fixture().await;
        let agent = Agent::new("w2", AgentRole::Worker);
        f.agents.insert(&agent).await.unwrap();
        f.agents
            .set_status(agent.id, AgentStatus::Stuck, None, None)
            .await
            .unwrap();

        let outcome = f.handler.handle_stuck(agent.id, "stale").await.unwrap();
        assert_eq!(outcome, StuckOutcome::AgentReset);
        let agent = f.agents.get(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(f.bus.published_count(EventKind::AgentIdle), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let f = fixture().await;
        assert!(f.handler.handle_stuck(Uuid::new_v4(), "stale").await.is_err());
    }
}
