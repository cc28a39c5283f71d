//! QA service.
//!
//! Holds the FIFO of tasks waiting for verification and runs them through the
//! verifier under a concurrency ceiling (1 by default, so verification is
//! serial). High CPU load switches the service off; the queue drains again
//! when load returns to normal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, AgentRole, AgentStatus, QaConfig, Task, TaskStatus, TransitionSource};
use crate::domain::ports::{AgentRepository, TaskRepository, VerificationReport, Verifier};
use crate::services::event_bus::{
    panic_message, Envelope, Event, EventBus, EventHandler, EventKind, Subscription,
};
use crate::services::task_state_machine::{TaskStateMachine, TransitionContext};

/// Events the QA service reacts to.
pub const QA_EVENTS: [EventKind; 4] = [
    EventKind::TaskReadyForQa,
    EventKind::SystemCpuHigh,
    EventKind::SystemCpuNormal,
    EventKind::SystemShutdown,
];

#[derive(Debug, Clone)]
struct QueuedTask {
    task: Task,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
}

#[derive(Debug)]
struct QaState {
    queue: VecDeque<QueuedTask>,
    in_flight: HashSet<Uuid>,
    enabled: bool,
    active: usize,
    passed: u64,
    failed: u64,
    errored: u64,
    dropped: u64,
}

/// Snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct QaStatus {
    pub queue_length: usize,
    pub enabled: bool,
    pub processing: bool,
    pub active_count: usize,
    pub max_concurrent: usize,
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    pub dropped: u64,
}

enum Outcome {
    Verdict(VerificationReport),
    Error(String),
}

struct Inner {
    config: QaConfig,
    state: Mutex<QaState>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    state_machine: Arc<TaskStateMachine>,
    verifier: Arc<dyn Verifier>,
    bus: Arc<EventBus>,
}

#[derive(Clone)]
pub struct QaService {
    inner: Arc<Inner>,
}

impl QaService {
    pub fn new(
        config: QaConfig,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        state_machine: Arc<TaskStateMachine>,
        verifier: Arc<dyn Verifier>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QaState {
                    queue: VecDeque::new(),
                    in_flight: HashSet::new(),
                    enabled: true,
                    active: 0,
                    passed: 0,
                    failed: 0,
                    errored: 0,
                    dropped: 0,
                }),
                tasks,
                agents,
                state_machine,
                verifier,
                bus,
            }),
        }
    }

    /// Register on the bus for every event in [`QA_EVENTS`].
    pub fn subscribe(&self, bus: &EventBus) -> Vec<Subscription> {
        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        bus.subscribe_many(&QA_EVENTS, &handler)
    }

    /// Add a task to the queue. Returns false if it is already queued or
    /// being verified.
    pub fn enqueue(&self, task: Task) -> bool {
        let task_id = task.id;
        {
            let mut state = self.inner.state.lock();
            if state.in_flight.contains(&task_id) || state.queue.iter().any(|q| q.task.id == task_id) {
                debug!(task_id = %task_id, "Task already queued for QA");
                return false;
            }
            state.queue.push_back(QueuedTask {
                task,
                enqueued_at: Utc::now(),
                attempts: 0,
            });
            debug!(task_id = %task_id, queue_length = state.queue.len(), "Queued task for QA");
        }
        self.inner.kick();
        true
    }

    /// Soft switch. Disabling stops new verifications; in-flight ones finish.
    pub fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.enabled != enabled;
            state.enabled = enabled;
            changed
        };
        if changed {
            info!(enabled, "QA service toggled");
        }
        if enabled {
            self.inner.kick();
        }
    }

    pub fn status(&self) -> QaStatus {
        let state = self.inner.state.lock();
        QaStatus {
            queue_length: state.queue.len(),
            enabled: state.enabled,
            processing: state.active > 0,
            active_count: state.active,
            max_concurrent: self.inner.config.max_concurrent,
            passed: state.passed,
            failed: state.failed,
            errored: state.errored,
            dropped: state.dropped,
        }
    }

    /// Queue every task already waiting in `ready_for_qa`, e.g. after a restart.
    pub async fn recover_backlog(&self) -> DomainResult<usize> {
        let waiting = self.inner.tasks.list_by_status(TaskStatus::ReadyForQa).await?;
        let mut queued = 0;
        for task in waiting {
            if self.enqueue(task) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(count = queued, "Recovered QA backlog");
        }
        Ok(queued)
    }
}

impl Inner {
    /// Start workers until the ceiling is reached or the queue is empty.
    fn kick(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while state.enabled && state.active < self.config.max_concurrent {
            let Some(item) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            state.in_flight.insert(item.task.id);
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_worker(item).await });
        }
    }

    async fn run_worker(self: Arc<Self>, first: QueuedTask) {
        let mut next = Some(first);
        while let Some(item) = next.take() {
            let task_id = item.task.id;
            self.process(item).await;

            let mut state = self.state.lock();
            state.in_flight.remove(&task_id);
            next = if state.enabled {
                state.queue.pop_front()
            } else {
                None
            };
            match &next {
                Some(item) => {
                    state.in_flight.insert(item.task.id);
                }
                None => state.active -= 1,
            }
        }
    }

    async fn process(&self, item: QueuedTask) {
        let task_id = item.task.id;
        let agent = match self.verifier_agent().await {
            Ok(agent) => Some(agent),
            Err(e) => {
                warn!(error = %e, "Verifier agent unavailable; verifying without it");
                None
            }
        };

        if let Some(agent) = &agent {
            if let Err(e) = self
                .agents
                .set_status(agent.id, AgentStatus::Working, Some(task_id), None)
                .await
            {
                warn!(agent_id = %agent.id, error = %e, "Failed to mark verifier working");
            }
            // The last stamp may predate a long idle gap.
            if let Err(e) = self.agents.touch_heartbeat(agent.id).await {
                debug!(agent_id = %agent.id, error = %e, "Failed to refresh verifier heartbeat");
            }
            self.bus.publish(Event::AgentWorking {
                agent_id: agent.id,
                task_id,
            });
        }

        info!(
            task_id = %task_id,
            display_id = %item.task.display_id,
            attempt = item.attempts + 1,
            waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds(),
            "Verifying task"
        );

        let outcome = match AssertUnwindSafe(self.verifier.verify(task_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) => Outcome::Verdict(report),
            Ok(Err(e)) => Outcome::Error(e.to_string()),
            Err(panic) => Outcome::Error(format!("verifier panicked: {}", panic_message(panic.as_ref()))),
        };

        match outcome {
            Outcome::Verdict(report) => self.apply_verdict(task_id, &report).await,
            Outcome::Error(message) => self.retry_or_drop(item, &message),
        }

        // Always hand the verifier slot back.
        if let Some(agent) = &agent {
            if let Err(e) = self
                .agents
                .set_status(agent.id, AgentStatus::Idle, None, None)
                .await
            {
                error!(agent_id = %agent.id, error = %e, "Failed to reset verifier agent");
            }
            if let Err(e) = self.agents.touch_heartbeat(agent.id).await {
                debug!(agent_id = %agent.id, error = %e, "Failed to refresh verifier heartbeat");
            }
            self.bus.publish(Event::AgentIdle { agent_id: agent.id });
        }
    }

    async fn apply_verdict(&self, task_id: Uuid, report: &VerificationReport) {
        let (target, ctx) = if report.passed {
            (
                TaskStatus::Completed,
                TransitionContext::new(TransitionSource::Qa),
            )
        } else {
            let failing: Vec<&str> = report
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| c.name.as_str())
                .collect();
            let message = if failing.is_empty() {
                report.summary.clone()
            } else {
                format!("{} (failing: {})", report.summary, failing.join(", "))
            };
            (
                TaskStatus::Failed,
                TransitionContext::new(TransitionSource::Qa).with_error(message),
            )
        };

        match self.state_machine.transition(task_id, target, ctx).await {
            Ok(_) => {
                let mut state = self.state.lock();
                if report.passed {
                    state.passed += 1;
                } else {
                    state.failed += 1;
                }
                info!(task_id = %task_id, passed = report.passed, summary = %report.summary, "Verification finished");
            }
            Err(e) => {
                warn!(task_id = %task_id, code = e.code(), error = %e, "Could not record verification result");
            }
        }
    }

    fn retry_or_drop(&self, mut item: QueuedTask, message: &str) {
        item.attempts += 1;
        let task_id = item.task.id;
        let mut state = self.state.lock();
        state.errored += 1;

        if item.attempts >= self.config.max_attempts {
            state.dropped += 1;
            error!(
                task_id = %task_id,
                attempts = item.attempts,
                error = %message,
                "Verification kept erroring; dropping task from QA queue"
            );
            return;
        }

        warn!(
            task_id = %task_id,
            attempts = item.attempts,
            error = %message,
            "Verification errored; requeueing"
        );
        if !state.queue.iter().any(|q| q.task.id == task_id) {
            state.queue.push_back(item);
        }
    }

    /// The named verifier slot, registered on first use.
    async fn verifier_agent(&self) -> DomainResult<Agent> {
        if let Some(agent) = self.agents.get_by_name(&self.config.agent_name).await? {
            return Ok(agent);
        }
        let agent = Agent::new(self.config.agent_name.clone(), AgentRole::Verifier);
        self.agents.insert(&agent).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Registered verifier agent");
        Ok(agent)
    }
}

#[async_trait]
impl EventHandler for QaService {
    fn name(&self) -> &str {
        "qa_service"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), String> {
        match &envelope.event {
            Event::TaskReadyForQa { task_id } => {
                let task = self
                    .inner
                    .tasks
                    .get(*task_id)
                    .await
                    .map_err(|e| e.to_string())?;
                match task {
                    Some(task) if task.status == TaskStatus::ReadyForQa => {
                        self.enqueue(task);
                    }
                    Some(task) => {
                        debug!(task_id = %task_id, status = %task.status, "Skipping QA for task no longer ready");
                    }
                    None => return Err(format!("task {task_id} not found")),
                }
            }
            Event::SystemCpuHigh { .. } | Event::SystemShutdown => self.set_enabled(false),
            Event::SystemCpuNormal { .. } => self.set_enabled(true),
            _ => {}
        }
        Ok(())
    }
}
