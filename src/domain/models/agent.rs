use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Agent status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Stuck,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Stuck => "stuck",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "stuck" => Ok(Self::Stuck),
            _ => Err(anyhow::anyhow!("Invalid agent status: {s}")),
        }
    }
}

/// What an agent slot is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Executes tasks from the backlog
    Worker,
    /// Runs verification for the QA service
    Verifier,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Verifier => "verifier",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worker" => Ok(Self::Worker),
            "verifier" => Ok(Self::Verifier),
            _ => Err(anyhow::anyhow!("Invalid agent role: {s}")),
        }
    }
}

/// A logical worker slot that executes one task at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub id: Uuid,

    /// Display name, unique across the fleet
    pub name: String,

    pub role: AgentRole,

    /// Current agent status
    pub status: AgentStatus,

    /// ID of the currently executing task (if any)
    pub current_task_id: Option<Uuid>,

    /// ID of the worker session executing that task (if any)
    pub current_session_id: Option<Uuid>,

    /// Last heartbeat timestamp
    pub heartbeat_at: DateTime<Utc>,

    pub tasks_completed: u32,
    pub tasks_failed: u32,

    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Create a new idle agent.
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            status: AgentStatus::Idle,
            current_task_id: None,
            current_session_id: None,
            heartbeat_at: now,
            tasks_completed: 0,
            tasks_failed: 0,
            created_at: now,
        }
    }

    /// How long since the last heartbeat, measured against `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }

    /// Check if agent is stale based on heartbeat threshold
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.heartbeat_age(now) > threshold
    }
}
