//! Common test utilities for integration tests
//!
//! Builds a full `EventSystem` over an in-memory SQLite store with scripted
//! collaborators, plus polling helpers for asserting on asynchronous effects.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conductor::adapters::mock::{MockLauncher, MockVerifier, RecordingNotifier};
use conductor::adapters::sqlite::{
    create_migrated_test_pool, SqliteAgentRepository, SqliteContextRepository,
    SqliteTaskRepository,
};
use conductor::application::{EventSystem, EventSystemDeps, ScriptedSampler};
use conductor::domain::models::{Agent, AgentRole, Config, Task};
use conductor::domain::ports::{AgentRepository, TaskRepository};

pub struct Harness {
    pub system: EventSystem,
    pub tasks: Arc<dyn TaskRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub launcher: Arc<MockLauncher>,
    pub verifier: Arc<MockVerifier>,
    pub notifier: RecordingNotifier,
}

/// Config with timers slow enough that tests drive scanners by hand.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scanners.pending_interval_secs = 3600;
    config.scanners.ready_for_qa_interval_secs = 3600;
    config.scanners.stuck_interval_secs = 3600;
    config.scanners.planning_interval_secs = 3600;
    config.scanners.cleanup_interval_secs = 3600;
    config.resources.sample_interval_secs = 3600;
    config
}

pub async fn harness(config: Config) -> Harness {
    harness_with_sampler(config, ScriptedSampler::idle()).await
}

/// Like [`harness`], with scripted CPU and memory readings.
pub async fn harness_with_sampler(config: Config, sampler: ScriptedSampler) -> Harness {
    let pool = create_migrated_test_pool()
        .await
        .expect("Failed to create test pool");
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let launcher = Arc::new(MockLauncher::new());
    let verifier = Arc::new(MockVerifier::new());
    let notifier = RecordingNotifier::new();

    let deps = EventSystemDeps {
        tasks: Arc::clone(&tasks),
        agents: Arc::clone(&agents),
        context: Arc::new(SqliteContextRepository::new(pool)),
        launcher: launcher.clone(),
        verifier: verifier.clone(),
        notifier: Arc::new(notifier.clone()),
        sampler: Box::new(sampler),
    };

    Harness {
        system: EventSystem::new(config, deps),
        tasks,
        agents,
        launcher,
        verifier,
        notifier,
    }
}

impl Harness {
    /// Init the system and wait for every scanner's immediate first tick, so
    /// later polls are driven only by the test.
    pub async fn start(&self) {
        self.system.init().await.expect("init event system");
        let system = &self.system;
        let settled = wait_until(
            || async move {
                system
                    .status()
                    .await
                    .scanners
                    .iter()
                    .all(|s| s.polls >= 1)
            },
            3000,
        )
        .await;
        assert!(settled, "scanners did not run their first tick");
    }

    pub async fn add_task(&self, title: &str) -> Task {
        let task = Task::with_title(title, "integration test task");
        self.tasks.insert(&task).await.expect("insert task");
        task
    }

    pub async fn add_worker(&self, name: &str) -> Agent {
        let agent = Agent::new(name, AgentRole::Worker);
        self.agents.insert(&agent).await.expect("insert agent");
        agent
    }

    pub async fn task(&self, task: &Task) -> Task {
        self.tasks
            .get(task.id)
            .await
            .expect("get task")
            .expect("task exists")
    }

    pub async fn agent(&self, agent: &Agent) -> Agent {
        self.agents
            .get(agent.id)
            .await
            .expect("get agent")
            .expect("agent exists")
    }
}

/// Poll an async condition every 20ms until it holds or `timeout_ms` passes.
pub async fn wait_until<F, Fut>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate().await
}
