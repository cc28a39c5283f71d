//! Worker launcher backed by an external command.
//!
//! The command is expected to start the worker (detached or remote) and exit
//! promptly:
//! - exit 0: started; a UUID on the first stdout line becomes the session id
//! - exit 75: rate limited; a `retry_after=<secs>` stdout line is honoured
//! - anything else: launch failure, stderr is reported

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{base_command, timeout_of, ENV_AGENT_ID, ENV_SESSION_ID, ENV_TASK_ID, EXIT_RATE_LIMITED};
use crate::domain::models::CommandConfig;
use crate::domain::ports::{LaunchResult, WorkerLauncher};

pub struct ProcessLauncher {
    config: CommandConfig,
}

impl ProcessLauncher {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch_worker(&self, task_id: Uuid, agent_id: Uuid) -> LaunchResult {
        if self.config.program.is_empty() {
            return LaunchResult::failed("no launch command configured");
        }

        let proposed_session = Uuid::new_v4();
        let mut cmd = base_command(&self.config);
        cmd.env(ENV_TASK_ID, task_id.to_string())
            .env(ENV_AGENT_ID, agent_id.to_string())
            .env(ENV_SESSION_ID, proposed_session.to_string());

        let run = cmd.output();
        let output = match timeout_of(&self.config) {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    return LaunchResult::failed(format!(
                        "launch command timed out after {}s",
                        limit.as_secs()
                    ))
                }
            },
            None => run.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.config.program, error = %e, "Failed to run launch command");
                return LaunchResult::failed(format!("failed to run launch command: {e}"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {
                let session_id = parse_session_id(&stdout).unwrap_or(proposed_session);
                debug!(task_id = %task_id, session_id = %session_id, "Launch command succeeded");
                LaunchResult::Started { session_id }
            }
            Some(EXIT_RATE_LIMITED) => {
                LaunchResult::rate_limited(stderr.trim().to_string(), parse_retry_after(&stdout))
            }
            code => LaunchResult::failed(format!(
                "launch command exited with {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )),
        }
    }
}

fn parse_session_id(stdout: &str) -> Option<Uuid> {
    stdout
        .lines()
        .next()
        .and_then(|line| Uuid::parse_str(line.trim()).ok())
}

fn parse_retry_after(stdout: &str) -> Option<Duration> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("retry_after="))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
