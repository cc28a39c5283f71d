//! `conductor status`: counts read from the store.
//!
//! The live queues, backoff and resource readings belong to a running
//! orchestrator and are logged by `conductor run --status-interval`.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::sqlite::{SqliteAgentRepository, SqliteTaskRepository};
use crate::cli::commands::open_database;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, TaskStatus};
use crate::domain::ports::{AgentFilter, AgentRepository, TaskRepository};

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub database: String,
    pub tasks: BTreeMap<&'static str, usize>,
    pub agents: BTreeMap<String, usize>,
    pub total_tasks: usize,
    pub total_agents: usize,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!("Database: {}", self.database), String::new()];
        lines.push(format!("Tasks ({}):", self.total_tasks));
        for (status, count) in &self.tasks {
            lines.push(format!("  {status:<14} {count}"));
        }
        lines.push(format!("Agents ({}):", self.total_agents));
        if self.agents.is_empty() {
            lines.push("  none registered".to_string());
        }
        for (key, count) in &self.agents {
            lines.push(format!("  {key:<14} {count}"));
        }
        lines.join("\n")
    }
}

pub async fn execute(config: &Config, json: bool) -> Result<()> {
    let pool = open_database(config).await?;
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool));
    let status = collect(&tasks, &agents, &config.database.path).await?;
    output(&status, json);
    Ok(())
}

async fn collect(
    tasks: &Arc<dyn TaskRepository>,
    agents: &Arc<dyn AgentRepository>,
    database: &str,
) -> Result<StatusOutput> {
    let mut task_counts = BTreeMap::new();
    for status in TaskStatus::ALL {
        task_counts.insert(status.as_str(), tasks.list_by_status(status).await?.len());
    }

    let mut agent_counts = BTreeMap::new();
    let all_agents = agents.list(AgentFilter::default()).await?;
    for agent in &all_agents {
        *agent_counts
            .entry(format!("{}/{}", agent.role, agent.status))
            .or_insert(0) += 1;
    }

    Ok(StatusOutput {
        database: database.to_string(),
        total_tasks: task_counts.values().sum(),
        tasks: task_counts,
        total_agents: all_agents.len(),
        agents: agent_counts,
    })
}
