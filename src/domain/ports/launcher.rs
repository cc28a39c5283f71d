//! Worker launch port.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// Outcome of asking the launcher to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    Started {
        session_id: Uuid,
    },
    Failed {
        error: String,
        /// The launcher was refused by an upstream rate limit
        rate_limited: bool,
        /// Upstream hint for how long to wait
        retry_after: Option<Duration>,
    },
}

impl LaunchResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            rate_limited: false,
            retry_after: None,
        }
    }

    pub fn rate_limited(error: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Failed {
            error: error.into(),
            rate_limited: true,
            retry_after,
        }
    }
}

/// Starts a worker session executing `task_id` on behalf of `agent_id`.
///
/// Launch failures are values, not errors: the caller leaves the task
/// pending and the next scan picks it up again.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch_worker(&self, task_id: Uuid, agent_id: Uuid) -> LaunchResult;
}
