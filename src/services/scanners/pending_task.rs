use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::Scanner;
use crate::domain::errors::DomainResult;
use crate::domain::models::TaskStatus;
use crate::domain::ports::TaskRepository;
use crate::services::event_bus::{Event, EventBus};
use crate::services::expiring_set::ExpiringSet;

/// Announces pending tasks whose dependencies have all completed.
///
/// A task announced within the re-emit window is not announced again, so a
/// task that sits in the spawn queue is not piled up on every poll.
pub struct PendingTaskScanner {
    tasks: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
    announced: ExpiringSet<Uuid>,
}

impl PendingTaskScanner {
    pub fn new(tasks: Arc<dyn TaskRepository>, bus: Arc<EventBus>, reemit_after: Duration) -> Self {
        Self {
            tasks,
            bus,
            announced: ExpiringSet::new(reemit_after),
        }
    }

    async fn is_ready(&self, task_id: Uuid) -> DomainResult<bool> {
        let deps = self.tasks.get_dependencies(task_id).await?;
        Ok(deps.iter().all(|d| d.status == TaskStatus::Completed))
    }
}

#[async_trait]
impl Scanner for PendingTaskScanner {
    fn name(&self) -> &'static str {
        "pending_task"
    }

    async fn poll(&self) -> DomainResult<usize> {
        let pending = self.tasks.list_by_status(TaskStatus::Pending).await?;
        let mut announced = 0;
        for task in pending {
            if !self.is_ready(task.id).await? {
                continue;
            }
            if !self.announced.insert_if_absent(task.id) {
                debug!(task_id = %task.id, "Pending task announced recently");
                continue;
            }
            self.bus.publish(Event::TaskPending { task_id: task.id });
            announced += 1;
        }
        Ok(announced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteTaskRepository};
    use crate::domain::models::{Task, TransitionSource};
    use crate::services::event_bus::EventKind;
    use crate::services::task_state_machine::{TaskStateMachine, TransitionContext};

    async fn setup(reemit: Duration) -> (PendingTaskScanner, Arc<dyn TaskRepository>, Arc<EventBus>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool));
        let bus = Arc::new(EventBus::new());
        let scanner = PendingTaskScanner::new(Arc::clone(&tasks), Arc::clone(&bus), reemit);
        (scanner, tasks, bus)
    }

    #[tokio::test]
    async fn test_only_tasks_with_completed_dependencies_are_announced() {
        let (scanner, tasks, bus) = setup(Duration::from_secs(60)).await;
        let sm = TaskStateMachine::new(Arc::clone(&tasks), Arc::clone(&bus));

        let upstream = Task::with_title("schema", "");
        tasks.insert(&upstream).await.unwrap();
        let downstream = Task::with_title("api", "").with_dependency(upstream.id);
        tasks.insert(&downstream).await.unwrap();

        let mut rx = bus.watch(&[EventKind::TaskPending]);
        assert_eq!(scanner.poll().await.unwrap(), 1);
        assert_eq!(
            rx.recv().await.unwrap().event,
            Event::TaskPending { task_id: upstream.id }
        );

        for step in [TaskStatus::InProgress, TaskStatus::ReadyForQa, TaskStatus::Completed] {
            sm.transition(upstream.id, step, TransitionContext::new(TransitionSource::Operator))
                .await
                .unwrap();
        }

        assert_eq!(scanner.poll().await.unwrap(), 1);
        assert_eq!(
            rx.recv().await.unwrap().event,
            Event::TaskPending { task_id: downstream.id }
        );
    }

    #[tokio::test]
    async fn test_recently_announced_task_is_not_repeated() {
        let (scanner, tasks, bus) = setup(Duration::from_secs(60)).await;
        tasks.insert(&Task::with_title("t", "")).await.unwrap();

        assert_eq!(scanner.poll().await.unwrap(), 1);
        assert_eq!(scanner.poll().await.unwrap(), 0);
        assert_eq!(bus.published_count(EventKind::TaskPending), 1);
    }

    #[tokio::test]
    async fn test_announcement_repeats_after_window() {
        let (scanner, tasks, bus) = setup(Duration::from_millis(20)).await;
        tasks.insert(&Task::with_title("t", "")).await.unwrap();

        scanner.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        scanner.poll().await.unwrap();
        assert_eq!(bus.published_count(EventKind::TaskPending), 2);
    }
}
