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

/// Announces tasks sitting in `ready_for_qa`.
///
/// Covers hand-offs made from another process, whose `task:ready_for_qa`
/// never reached this bus, and tasks the QA service dropped after repeated
/// verifier errors. The QA queue ignores tasks it already holds, and the
/// spawn service frees the worker still bound to the task.
pub struct ReadyForQaScanner {
    tasks: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
    announced: ExpiringSet<Uuid>,
}

impl ReadyForQaScanner {
    pub fn new(tasks: Arc<dyn TaskRepository>, bus: Arc<EventBus>, reemit_after: Duration) -> Self {
        Self {
            tasks,
            bus,
            announced: ExpiringSet::new(reemit_after),
        }
    }
}

#[async_trait]
impl Scanner for ReadyForQaScanner {
    fn name(&self) -> &'static str {
        "ready_for_qa"
    }

    async fn poll(&self) -> DomainResult<usize> {
        let waiting = self.tasks.list_by_status(TaskStatus::ReadyForQa).await?;
        let mut announced = 0;
        for task in waiting {
            if !self.announced.insert_if_absent(task.id) {
                debug!(task_id = %task.id, "Ready-for-QA task announced recently");
                continue;
            }
            self.bus.publish(Event::TaskReadyForQa { task_id: task.id });
            announced += 1;
        }
        Ok(announced)
    }
}
