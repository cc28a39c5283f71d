//! Orchestration facade.
//!
//! Builds every component once from explicit dependencies and owns their
//! lifecycle. `init` wires the reactive services to the bus, starts the
//! resource monitor, and starts the scanners. `shutdown` announces
//! `system:shutdown`, stops the timers, and clears the bus. Both are
//! idempotent. `status` is the one aggregate snapshot the core exposes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::notify::LogNotifier;
use crate::adapters::process::{CommandVerifier, ProcessLauncher};
use crate::adapters::sqlite::{SqliteAgentRepository, SqliteContextRepository, SqliteTaskRepository};
use crate::application::resource_monitor::{
    LoadLevel, ResourceMonitor, ResourceSampler, ResourceState, SysinfoSampler,
};
use crate::domain::errors::DomainResult;
use crate::domain::models::Config;
use crate::domain::ports::{
    AgentRepository, ContextRepository, Notifier, TaskRepository, Verifier, WorkerLauncher,
};
use crate::services::event_bus::{BusStats, Event, EventBus, Subscription};
use crate::services::qa_service::{QaService, QaStatus};
use crate::services::rate_limit_backoff::{
    to_chrono, BackoffPolicy, BackoffStatus, HitOutcome, RateLimitBackoff,
};
use crate::services::retry_handler::FailedTaskRetryHandler;
use crate::services::scanners::{
    CleanupScanner, PendingTaskScanner, PeriodicScanner, PlanningScanner, ReadyForQaScanner,
    ScannerStatus, StuckAgentScanner,
};
use crate::services::spawn_service::{SpawnService, SpawnStatus};
use crate::services::stuck_agent_handler::StuckAgentHandler;
use crate::services::task_state_machine::TaskStateMachine;

/// External collaborators the facade is built from.
pub struct EventSystemDeps {
    pub tasks: Arc<dyn TaskRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub context: Arc<dyn ContextRepository>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub verifier: Arc<dyn Verifier>,
    pub notifier: Arc<dyn Notifier>,
    pub sampler: Box<dyn ResourceSampler>,
}

impl EventSystemDeps {
    /// Production wiring: SQLite store, external commands, host sampler.
    pub fn production(pool: SqlitePool, config: &Config) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
            agents: Arc::new(SqliteAgentRepository::new(pool.clone())),
            context: Arc::new(SqliteContextRepository::new(pool)),
            launcher: Arc::new(ProcessLauncher::new(config.spawn.launcher.clone())),
            verifier: Arc::new(CommandVerifier::new(config.qa.verifier.clone())),
            notifier: Arc::new(LogNotifier::new()),
            sampler: Box::new(SysinfoSampler::new()),
        }
    }
}

/// Aggregate read-only snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub initialized: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub qa: QaStatus,
    pub spawn: SpawnStatus,
    pub resources: ResourceState,
    pub backoff: BackoffStatus,
    pub scanners: Vec<ScannerStatus>,
    pub bus: BusStats,
}

#[derive(Default)]
struct Lifecycle {
    subscriptions: Vec<Subscription>,
    started_at: Option<DateTime<Utc>>,
}

pub struct EventSystem {
    config: Config,
    bus: Arc<EventBus>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    state_machine: Arc<TaskStateMachine>,
    backoff: Arc<RateLimitBackoff>,
    monitor: ResourceMonitor,
    qa: QaService,
    spawn: SpawnService,
    stuck_handler: Arc<StuckAgentHandler>,
    retry_handler: Arc<FailedTaskRetryHandler>,
    scanners: Vec<PeriodicScanner>,
    initialized: AtomicBool,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl EventSystem {
    pub fn new(config: Config, deps: EventSystemDeps) -> Self {
        let bus = Arc::new(EventBus::new());
        let state_machine = Arc::new(TaskStateMachine::new(
            Arc::clone(&deps.tasks),
            Arc::clone(&bus),
        ));
        let backoff = Arc::new(
            RateLimitBackoff::new(BackoffPolicy::from(&config.backoff))
                .with_notifier(Arc::clone(&deps.notifier), config.notifications.channel.clone()),
        );
        let monitor = ResourceMonitor::new(&config.resources, deps.sampler, Arc::clone(&bus));

        let qa = QaService::new(
            config.qa.clone(),
            Arc::clone(&deps.tasks),
            Arc::clone(&deps.agents),
            Arc::clone(&state_machine),
            deps.verifier,
            Arc::clone(&bus),
        );
        let spawn = SpawnService::new(
            config.spawn.clone(),
            Arc::clone(&deps.tasks),
            Arc::clone(&deps.agents),
            Arc::clone(&state_machine),
            deps.launcher,
            Arc::clone(&backoff),
            Arc::clone(&bus),
        );
        let stuck_handler = Arc::new(StuckAgentHandler::new(
            &config.recovery,
            Arc::clone(&deps.tasks),
            Arc::clone(&deps.agents),
            Arc::clone(&state_machine),
            Arc::clone(&bus),
            Arc::clone(&deps.notifier),
            config.notifications.channel.clone(),
        ));
        let retry_handler = Arc::new(FailedTaskRetryHandler::new(
            Arc::clone(&deps.tasks),
            Arc::clone(&state_machine),
            config.recovery.max_retries,
        ));

        let sc = &config.scanners;
        let scanners = vec![
            PeriodicScanner::new(
                Arc::new(PendingTaskScanner::new(
                    Arc::clone(&deps.tasks),
                    Arc::clone(&bus),
                    Duration::from_secs(sc.pending_reemit_secs),
                )),
                Duration::from_secs(sc.pending_interval_secs),
            ),
            PeriodicScanner::new(
                Arc::new(ReadyForQaScanner::new(
                    Arc::clone(&deps.tasks),
                    Arc::clone(&bus),
                    Duration::from_secs(sc.ready_for_qa_reemit_secs),
                )),
                Duration::from_secs(sc.ready_for_qa_interval_secs),
            ),
            PeriodicScanner::new(
                Arc::new(StuckAgentScanner::new(
                    Arc::clone(&deps.agents),
                    Arc::clone(&bus),
                    to_chrono(Duration::from_secs(sc.stall_threshold_secs)),
                )),
                Duration::from_secs(sc.stuck_interval_secs),
            ),
            PeriodicScanner::new(
                Arc::new(PlanningScanner::new(
                    Arc::clone(&bus),
                    to_chrono(Duration::from_secs(sc.planning_period_mins.saturating_mul(60))),
                )),
                Duration::from_secs(sc.planning_interval_secs),
            ),
            PeriodicScanner::new(
                Arc::new(CleanupScanner::new(deps.context)),
                Duration::from_secs(sc.cleanup_interval_secs),
            ),
        ];

        Self {
            config,
            bus,
            tasks: deps.tasks,
            agents: deps.agents,
            state_machine,
            backoff,
            monitor,
            qa,
            spawn,
            stuck_handler,
            retry_handler,
            scanners,
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    /// Start everything. A second call while running does nothing.
    pub async fn init(&self) -> DomainResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        // Subscribe before sampling starts: load events fire only on an edge.
        let mut subscriptions = self.qa.subscribe(&self.bus);
        subscriptions.extend(self.spawn.subscribe(&self.bus));
        subscriptions.push(self.stuck_handler.subscribe(&self.bus));
        subscriptions.push(self.retry_handler.subscribe(&self.bus));

        // Gates keep their level across a restart, so seed from it.
        let resources = self.monitor.get_state();
        self.qa.set_enabled(resources.cpu == LoadLevel::Normal);
        self.spawn.seed_pressure(
            resources.cpu == LoadLevel::High,
            resources.memory == LoadLevel::High,
        );
        self.spawn.set_enabled(true);

        self.monitor.start();

        if let Err(e) = self.qa.recover_backlog().await {
            warn!(error = %e, "Could not recover QA backlog");
        }

        for scanner in &self.scanners {
            scanner.start();
        }

        lifecycle.subscriptions = subscriptions;
        lifecycle.started_at = Some(Utc::now());
        self.initialized.store(true, Ordering::Release);
        info!(
            subscriptions = lifecycle.subscriptions.len(),
            scanners = self.scanners.len(),
            "Event system initialized"
        );
        Ok(())
    }

    /// Stop everything. A call while stopped does nothing.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }

        self.bus.publish(Event::SystemShutdown);
        // Do not rely on delivery order for the soft stop.
        self.qa.set_enabled(false);
        self.spawn.set_enabled(false);

        for scanner in &self.scanners {
            scanner.stop().await;
        }
        self.monitor.stop().await;
        self.bus.remove_all();

        lifecycle.subscriptions.clear();
        lifecycle.started_at = None;
        self.initialized.store(false, Ordering::Release);
        info!("Event system shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> SystemStatus {
        let started_at = self.lifecycle.lock().await.started_at;
        SystemStatus {
            initialized: self.is_initialized(),
            started_at,
            qa: self.qa.status(),
            spawn: self.spawn.status(),
            resources: self.monitor.get_state(),
            backoff: self.backoff.status(),
            scanners: self.scanners.iter().map(PeriodicScanner::status).collect(),
            bus: self.bus.stats(),
        }
    }

    /// Feed an externally observed rate limit into the backoff controller.
    pub async fn report_rate_limit(&self, explicit: Option<Duration>) -> HitOutcome {
        self.backoff.record_limit_hit(explicit).await
    }

    /// Run one poll of the named scanner now. `None` if no such scanner.
    pub async fn poll_scanner(&self, name: &str) -> Option<DomainResult<usize>> {
        let scanner = self.scanners.iter().find(|s| s.name() == name)?;
        Some(scanner.poll_now().await)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRepository> {
        &self.tasks
    }

    pub fn agents(&self) -> &Arc<dyn AgentRepository> {
        &self.agents
    }

    pub fn backoff(&self) -> &Arc<RateLimitBackoff> {
        &self.backoff
    }

    pub fn qa(&self) -> &QaService {
        &self.qa
    }

    pub fn spawn(&self) -> &SpawnService {
        &self.spawn
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }
}
