//! Spawn service.
//!
//! Turns `task:pending` into running workers. Dispatch pauses while CPU or
//! memory is high, while rate-limit backoff is active, and while the number
//! of working worker agents is at the configured ceiling. A failed launch
//! leaves the task `pending`; the pending scanner announces it again later.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, AgentRole, AgentStatus, SpawnConfig, TaskStatus, TransitionSource,
};
use crate::domain::ports::{AgentFilter, AgentRepository, LaunchResult, TaskRepository, WorkerLauncher};
use crate::services::event_bus::{
    panic_message, Envelope, Event, EventBus, EventHandler, EventKind, Subscription,
};
use crate::services::rate_limit_backoff::RateLimitBackoff;
use crate::services::task_state_machine::{TaskStateMachine, TransitionContext};

/// Events the spawn service reacts to.
pub const SPAWN_EVENTS: [EventKind; 9] = [
    EventKind::TaskPending,
    EventKind::TaskReadyForQa,
    EventKind::TaskFailed,
    EventKind::TaskBlocked,
    EventKind::SystemCpuHigh,
    EventKind::SystemCpuNormal,
    EventKind::SystemMemoryHigh,
    EventKind::SystemMemoryNormal,
    EventKind::SystemShutdown,
];

#[derive(Debug)]
struct SpawnState {
    queue: VecDeque<Uuid>,
    in_flight: HashSet<Uuid>,
    enabled: bool,
    cpu_high: bool,
    memory_high: bool,
    dispatching: bool,
    spawned: u64,
    launch_failures: u64,
    released: u64,
}

/// Snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnStatus {
    pub queue_length: usize,
    pub enabled: bool,
    pub paused_for_cpu: bool,
    pub paused_for_memory: bool,
    pub rate_limited: bool,
    pub dispatching: bool,
    pub in_flight: usize,
    pub max_concurrent_workers: usize,
    pub spawned: u64,
    pub launch_failures: u64,
    pub released: u64,
}

/// Why the dispatch loop stopped pulling work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Gated,
    Empty,
    AtCapacity,
    NoIdleWorker,
}

struct Inner {
    config: SpawnConfig,
    state: Mutex<SpawnState>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    state_machine: Arc<TaskStateMachine>,
    launcher: Arc<dyn WorkerLauncher>,
    backoff: Arc<RateLimitBackoff>,
    bus: Arc<EventBus>,
}

#[derive(Clone)]
pub struct SpawnService {
    inner: Arc<Inner>,
}

impl SpawnService {
    pub fn new(
        config: SpawnConfig,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        state_machine: Arc<TaskStateMachine>,
        launcher: Arc<dyn WorkerLauncher>,
        backoff: Arc<RateLimitBackoff>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SpawnState {
                    queue: VecDeque::new(),
                    in_flight: HashSet::new(),
                    enabled: true,
                    cpu_high: false,
                    memory_high: false,
                    dispatching: false,
                    spawned: 0,
                    launch_failures: 0,
                    released: 0,
                }),
                tasks,
                agents,
                state_machine,
                launcher,
                backoff,
                bus,
            }),
        }
    }

    pub fn subscribe(&self, bus: &EventBus) -> Vec<Subscription> {
        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        bus.subscribe_many(&SPAWN_EVENTS, &handler)
    }

    /// Queue a pending task for dispatch. Returns false if it is already
    /// queued or being launched. Either way the dispatch loop is nudged.
    pub fn enqueue(&self, task_id: Uuid) -> bool {
        let added = {
            let mut state = self.inner.state.lock();
            if state.in_flight.contains(&task_id) || state.queue.contains(&task_id) {
                false
            } else {
                state.queue.push_back(task_id);
                true
            }
        };
        if added {
            debug!(task_id = %task_id, "Queued task for dispatch");
        }
        self.inner.kick();
        added
    }

    /// Soft switch. In-flight launches finish.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.state.lock().enabled = enabled;
        info!(enabled, "Spawn service toggled");
        if enabled {
            self.inner.kick();
        }
    }

    pub fn status(&self) -> SpawnStatus {
        let rate_limited = self.inner.backoff.is_limited();
        let state = self.inner.state.lock();
        SpawnStatus {
            queue_length: state.queue.len(),
            enabled: state.enabled,
            paused_for_cpu: state.cpu_high,
            paused_for_memory: state.memory_high,
            rate_limited,
            dispatching: state.dispatching,
            in_flight: state.in_flight.len(),
            max_concurrent_workers: self.inner.config.max_concurrent_workers,
            spawned: state.spawned,
            launch_failures: state.launch_failures,
            released: state.released,
        }
    }

    /// Set both load flags from a known resource level, e.g. at startup.
    pub fn seed_pressure(&self, cpu_high: bool, memory_high: bool) {
        self.set_pressure(Some(cpu_high), Some(memory_high));
    }

    fn set_pressure(&self, cpu: Option<bool>, memory: Option<bool>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(high) = cpu {
                state.cpu_high = high;
            }
            if let Some(high) = memory {
                state.memory_high = high;
            }
            debug!(
                cpu_high = state.cpu_high,
                memory_high = state.memory_high,
                "Spawn backpressure updated"
            );
        }
        self.inner.kick();
    }

    /// Free the worker that was running `task_id` once the task left
    /// `in_progress`.
    async fn release_worker(&self, task_id: Uuid, succeeded: bool) -> DomainResult<()> {
        let workers = self
            .inner
            .agents
            .list(AgentFilter {
                role: Some(AgentRole::Worker),
                status: None,
            })
            .await?;
        let Some(agent) = workers
            .into_iter()
            .find(|a| a.current_task_id == Some(task_id))
        else {
            return Ok(());
        };

        self.inner
            .agents
            .set_status(agent.id, AgentStatus::Idle, None, None)
            .await?;
        self.inner.agents.record_outcome(agent.id, succeeded).await?;
        self.inner.state.lock().released += 1;

        info!(agent_id = %agent.id, task_id = %task_id, succeeded, "Released worker");
        self.inner.bus.publish(Event::AgentIdle { agent_id: agent.id });
        if let Some(session_id) = agent.current_session_id {
            self.inner.bus.publish(Event::SessionEnded {
                session_id,
                task_id,
                agent_id: agent.id,
            });
        }
        self.inner.kick();
        Ok(())
    }
}

impl Inner {
    fn gate_open(state: &SpawnState, backoff: &RateLimitBackoff) -> bool {
        state.enabled && !state.cpu_high && !state.memory_high && !backoff.is_limited()
    }

    /// Start the dispatch loop unless it is already running.
    fn kick(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching || state.queue.is_empty() || !Self::gate_open(&state, &self.backoff) {
                return;
            }
            state.dispatching = true;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.dispatch_loop().await });
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let hold = match self.next_dispatch().await {
                Ok(Ok((task_id, agent))) => {
                    self.dispatch(task_id, agent).await;
                    self.state.lock().in_flight.remove(&task_id);
                    continue;
                }
                Ok(Err(hold)) => hold,
                Err(e) => {
                    error!(error = %e, "Dispatch loop store error");
                    Hold::Gated
                }
            };

            let mut state = self.state.lock();
            // Work may have arrived while the last check ran unlocked.
            if hold == Hold::Empty && !state.queue.is_empty() {
                continue;
            }
            state.dispatching = false;
            debug!(?hold, queue_length = state.queue.len(), "Dispatch loop idle");
            return;
        }
    }

    /// Pick the next task and a free worker, or say why not.
    async fn next_dispatch(&self) -> DomainResult<Result<(Uuid, Agent), Hold>> {
        {
            let state = self.state.lock();
            if !Self::gate_open(&state, &self.backoff) {
                return Ok(Err(Hold::Gated));
            }
            if state.queue.is_empty() {
                return Ok(Err(Hold::Empty));
            }
        }

        let workers = self
            .agents
            .list(AgentFilter {
                role: Some(AgentRole::Worker),
                status: None,
            })
            .await?;
        let working = workers
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count();
        if working >= self.config.max_concurrent_workers {
            return Ok(Err(Hold::AtCapacity));
        }
        let Some(agent) = workers.into_iter().find(|a| a.status == AgentStatus::Idle) else {
            return Ok(Err(Hold::NoIdleWorker));
        };

        let mut state = self.state.lock();
        let Some(task_id) = state.queue.pop_front() else {
            return Ok(Err(Hold::Empty));
        };
        state.in_flight.insert(task_id);
        Ok(Ok((task_id, agent)))
    }

    async fn dispatch(&self, task_id: Uuid, agent: Agent) {
        match self.tasks.get(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Pending => {}
            Ok(Some(task)) => {
                debug!(task_id = %task_id, status = %task.status, "Skipping dispatch for task no longer pending");
                return;
            }
            Ok(None) => {
                warn!(task_id = %task_id, "Queued task disappeared");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to load task for dispatch");
                return;
            }
        }

        if let Err(e) = self
            .agents
            .set_status(agent.id, AgentStatus::Working, Some(task_id), None)
            .await
        {
            error!(agent_id = %agent.id, error = %e, "Failed to claim worker");
            return;
        }
        // A claimed worker starts with a fresh heartbeat, not the one from its last job.
        if let Err(e) = self.agents.touch_heartbeat(agent.id).await {
            debug!(agent_id = %agent.id, error = %e, "Failed to refresh worker heartbeat");
        }

        let result = match AssertUnwindSafe(self.launcher.launch_worker(task_id, agent.id))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => LaunchResult::failed(format!(
                "launcher panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            LaunchResult::Started { session_id } => self.on_started(task_id, &agent, session_id).await,
            LaunchResult::Failed {
                error,
                rate_limited,
                retry_after,
            } => {
                self.state.lock().launch_failures += 1;
                warn!(
                    task_id = %task_id,
                    agent_id = %agent.id,
                    rate_limited,
                    error = %error,
                    "Worker launch failed; task stays pending"
                );
                self.free_agent(agent.id).await;
                if rate_limited {
                    self.backoff.record_limit_hit(retry_after).await;
                }
            }
        }
    }

    async fn on_started(&self, task_id: Uuid, agent: &Agent, session_id: Uuid) {
        let ctx = TransitionContext::new(TransitionSource::Spawn)
            .with_agent(agent.id)
            .with_session(session_id);
        if let Err(e) = self
            .state_machine
            .transition(task_id, TaskStatus::InProgress, ctx)
            .await
        {
            warn!(
                task_id = %task_id,
                session_id = %session_id,
                code = e.code(),
                error = %e,
                "Worker started but task could not be claimed"
            );
            self.free_agent(agent.id).await;
            return;
        }

        if let Err(e) = self
            .agents
            .set_status(agent.id, AgentStatus::Working, Some(task_id), Some(session_id))
            .await
        {
            error!(agent_id = %agent.id, error = %e, "Failed to record worker session");
        }
        if let Err(e) = self.agents.touch_heartbeat(agent.id).await {
            debug!(agent_id = %agent.id, error = %e, "Failed to refresh worker heartbeat");
        }

        self.state.lock().spawned += 1;
        info!(
            task_id = %task_id,
            agent_id = %agent.id,
            agent = %agent.name,
            session_id = %session_id,
            "Worker dispatched"
        );
        self.bus.publish(Event::SessionStarted {
            session_id,
            task_id,
            agent_id: agent.id,
        });
        self.bus.publish(Event::AgentWorking {
            agent_id: agent.id,
            task_id,
        });
    }

    async fn free_agent(&self, agent_id: Uuid) {
        if let Err(e) = self
            .agents
            .set_status(agent_id, AgentStatus::Idle, None, None)
            .await
        {
            error!(agent_id = %agent_id, error = %e, "Failed to free worker");
        }
    }
}

#[async_trait]
impl EventHandler for SpawnService {
    fn name(&self) -> &str {
        "spawn_service"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), String> {
        match &envelope.event {
            Event::TaskPending { task_id } => {
                self.enqueue(*task_id);
            }
            Event::TaskReadyForQa { task_id } => {
                self.release_worker(*task_id, true)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Event::TaskFailed { task_id, .. } | Event::TaskBlocked { task_id, .. } => {
                self.release_worker(*task_id, false)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Event::SystemCpuHigh { .. } => self.set_pressure(Some(true), None),
            Event::SystemCpuNormal { .. } => self.set_pressure(Some(false), None),
            Event::SystemMemoryHigh { .. } => self.set_pressure(None, Some(true)),
            Event::SystemMemoryNormal { .. } => self.set_pressure(None, Some(false)),
            Event::SystemShutdown => self.set_enabled(false),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockLauncher;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteAgentRepository, SqliteTaskRepository,
    };
    use crate::domain::models::Task;
    use crate::services::event_bus::SequenceNumber;
    use crate::services::rate_limit_backoff::BackoffPolicy;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        spawn: SpawnService,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        sm: Arc<TaskStateMachine>,
        launcher: Arc<MockLauncher>,
        backoff: Arc<RateLimitBackoff>,
    }

    async fn fixture(max_workers: usize) -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool));
        let bus = Arc::new(EventBus::new());
        let sm = Arc::new(TaskStateMachine::new(Arc::clone(&tasks), Arc::clone(&bus)));
        let launcher = Arc::new(MockLauncher::new());
        let backoff = Arc::new(RateLimitBackoff::new(BackoffPolicy::default()));
        let config = SpawnConfig {
            max_concurrent_workers: max_workers,
            ..SpawnConfig::default()
        };
        let spawn = SpawnService::new(
            config,
            Arc::clone(&tasks),
            Arc::clone(&agents),
            Arc::clone(&sm),
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            Arc::clone(&backoff),
            bus,
        );
        Fixture {
            spawn,
            tasks,
            agents,
            sm,
            launcher,
            backoff,
        }
    }

    async fn worker(f: &Fixture, name: &str) -> Agent {
        let agent = Agent::new(name, AgentRole::Worker);
        f.agents.insert(&agent).await.unwrap();
        agent
    }

    async fn pending_task(f: &Fixture) -> Task {
        let task = Task::with_title("build", "");
        f.tasks.insert(&task).await.unwrap();
        task
    }

    async fn settle(spawn: &SpawnService) {
        for _ in 0..200 {
            if !spawn.status().dispatching {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatch loop did not settle");
    }

    fn envelope(event: Event) -> Envelope {
        Envelope {
            sequence: SequenceNumber(1),
            timestamp: Utc::now(),
            event,
        }
    }

    #[tokio::test]
    async fn test_successful_launch_starts_task_and_claims_worker() {
        let f = fixture(4).await;
        let agent = worker(&f, "w1").await;
        let task = pending_task(&f).await;

        assert!(f.spawn.enqueue(task.id));
        settle(&f.spawn).await;

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.assigned_agent_id, Some(agent.id));

        let agent = f.agents.get(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.current_task_id, Some(task.id));
        assert!(agent.current_session_id.is_some());
        assert_eq!(f.launcher.launches(), vec![(task.id, agent.id)]);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_task_pending() {
        let f = fixture(4).await;
        let agent = worker(&f, "w1").await;
        let task = pending_task(&f).await;
        f.launcher.push(LaunchResult::failed("no binary"));

        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        let agent = f.agents.get(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(f.spawn.status().launch_failures, 1);

        // Re-announced by the scanner, it goes through.
        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;
        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_claiming_worker_refreshes_stale_heartbeat() {
        let f = fixture(4).await;
        let mut agent = Agent::new("w1", AgentRole::Worker);
        agent.heartbeat_at = Utc::now() - chrono::Duration::minutes(20);
        f.agents.insert(&agent).await.unwrap();
        let task = pending_task(&f).await;
        // The launch fails, so only the claim can have stamped the heartbeat.
        f.launcher.push(LaunchResult::failed("no binary"));

        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;

        let stored = f.agents.get(agent.id).await.unwrap().unwrap();
        assert!(stored.heartbeat_age(Utc::now()) < chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_seeded_pressure_holds_dispatch() {
        let f = fixture(4).await;
        worker(&f, "w1").await;
        let task = pending_task(&f).await;

        f.spawn.seed_pressure(false, true);
        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;
        assert!(f.launcher.launches().is_empty());
        assert!(f.spawn.status().paused_for_memory);

        f.spawn.seed_pressure(false, false);
        settle(&f.spawn).await;
        assert_eq!(f.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_launch_pauses_dispatch() {
        let f = fixture(4).await;
        worker(&f, "w1").await;
        let first = pending_task(&f).await;
        let second = pending_task(&f).await;
        f.launcher
            .push(LaunchResult::rate_limited("429", Some(Duration::from_secs(120))));

        f.spawn.enqueue(first.id);
        settle(&f.spawn).await;
        assert!(f.backoff.is_limited());

        f.spawn.enqueue(second.id);
        settle(&f.spawn).await;
        assert_eq!(f.launcher.launches().len(), 1);
        assert!(f.spawn.status().rate_limited);
        assert_eq!(f.spawn.status().queue_length, 1);

        f.backoff.clear();
        f.spawn.enqueue(second.id);
        settle(&f.spawn).await;
        let stored = f.tasks.get(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_worker_ceiling_is_enforced() {
        let f = fixture(1).await;
        worker(&f, "w1").await;
        worker(&f, "w2").await;
        let a = pending_task(&f).await;
        let b = pending_task(&f).await;

        f.spawn.enqueue(a.id);
        f.spawn.enqueue(b.id);
        settle(&f.spawn).await;

        assert_eq!(f.launcher.launches().len(), 1);
        assert_eq!(f.spawn.status().queue_length, 1);
    }

    #[tokio::test]
    async fn test_load_events_gate_dispatch() {
        let f = fixture(4).await;
        worker(&f, "w1").await;
        let task = pending_task(&f).await;

        f.spawn
            .handle(&envelope(Event::SystemMemoryHigh { percent: 91.0 }))
            .await
            .unwrap();
        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;
        assert!(f.launcher.launches().is_empty());
        assert!(f.spawn.status().paused_for_memory);

        f.spawn
            .handle(&envelope(Event::SystemMemoryNormal { percent: 40.0 }))
            .await
            .unwrap();
        settle(&f.spawn).await;
        assert_eq!(f.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_release_on_ready_for_qa_frees_worker() {
        let f = fixture(4).await;
        let agent = worker(&f, "w1").await;
        let task = pending_task(&f).await;
        f.spawn.enqueue(task.id);
        settle(&f.spawn).await;

        f.sm
            .transition(
                task.id,
                TaskStatus::ReadyForQa,
                TransitionContext::new(TransitionSource::Worker),
            )
            .await
            .unwrap();
        f.spawn
            .handle(&envelope(Event::TaskReadyForQa { task_id: task.id }))
            .await
            .unwrap();

        let agent = f.agents.get(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task_id.is_none());
        assert!(agent.current_session_id.is_none());
        assert_eq!(agent.tasks_completed, 1);
        assert_eq!(f.spawn.status().released, 1);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let f = fixture(4).await;
        f.spawn.set_enabled(false);
        let task = pending_task(&f).await;

        assert!(f.spawn.enqueue(task.id));
        assert!(!f.spawn.enqueue(task.id));
        assert_eq!(f.spawn.status().queue_length, 1);
    }
}
