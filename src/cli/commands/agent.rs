//! Agent CLI commands.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::sync::Arc;

use crate::adapters::sqlite::SqliteAgentRepository;
use crate::cli::commands::open_database;
use crate::cli::output::{agent_table, output, CommandOutput};
use crate::domain::models::{Agent, AgentRole, AgentStatus, Config};
use crate::domain::ports::{AgentFilter, AgentRepository};

#[derive(Args, Debug)]
pub struct AgentArgs {
    #[command(subcommand)]
    pub command: AgentCommands,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Register an idle agent slot
    Register {
        /// Unique agent name
        name: String,
        /// Role (worker, verifier)
        #[arg(short, long, default_value = "worker")]
        role: String,
    },
    /// Record a heartbeat for an agent
    Heartbeat {
        /// Agent name
        name: String,
    },
    /// List agents
    List {
        /// Filter by role
        #[arg(short, long)]
        role: Option<String>,
        /// Filter by status (idle, working, stuck)
        #[arg(short, long)]
        status: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct AgentListOutput {
    pub agents: Vec<Agent>,
    pub total: usize,
}

impl CommandOutput for AgentListOutput {
    fn to_human(&self) -> String {
        if self.agents.is_empty() {
            return "No agents found.".to_string();
        }
        format!("{}\n{} agent(s)", agent_table(&self.agents), self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct AgentActionOutput {
    pub agent: Agent,
    pub message: String,
}

impl CommandOutput for AgentActionOutput {
    fn to_human(&self) -> String {
        format!(
            "{}: {} ({}, {})",
            self.message, self.agent.name, self.agent.role, self.agent.status
        )
    }
}

pub async fn execute(args: AgentArgs, config: &Config, json: bool) -> Result<()> {
    let pool = open_database(config).await?;
    let repo: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool));

    match args.command {
        AgentCommands::Register { name, role } => {
            let agent = register(&repo, &name, &role).await?;
            output(
                &AgentActionOutput {
                    agent,
                    message: "Agent registered".to_string(),
                },
                json,
            );
        }
        AgentCommands::Heartbeat { name } => {
            let agent = heartbeat(&repo, &name).await?;
            output(
                &AgentActionOutput {
                    agent,
                    message: "Heartbeat recorded".to_string(),
                },
                json,
            );
        }
        AgentCommands::List { role, status } => {
            let filter = AgentFilter {
                role: role.map(|r| r.parse::<AgentRole>()).transpose()?,
                status: status.map(|s| s.parse::<AgentStatus>()).transpose()?,
            };
            let agents = repo.list(filter).await.context("Failed to list agents")?;
            let total = agents.len();
            output(&AgentListOutput { agents, total }, json);
        }
    }
    Ok(())
}

async fn register(repo: &Arc<dyn AgentRepository>, name: &str, role: &str) -> Result<Agent> {
    let role: AgentRole = role.parse()?;
    if name.trim().is_empty() {
        bail!("Agent name cannot be empty");
    }
    if repo.get_by_name(name).await?.is_some() {
        bail!("An agent named '{name}' is already registered");
    }
    let agent = Agent::new(name, role);
    repo.insert(&agent).await.context("Failed to register agent")?;
    Ok(agent)
}

async fn heartbeat(repo: &Arc<dyn AgentRepository>, name: &str) -> Result<Agent> {
    let agent = repo
        .get_by_name(name)
        .await?
        .ok_or_else(|| anyhow!("Agent '{name}' not found"))?;
    repo.touch_heartbeat(agent.id).await?;
    repo.get(agent.id)
        .await?
        .ok_or_else(|| anyhow!("Agent '{name}' disappeared"))
}
