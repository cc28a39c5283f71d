//! Adapters that shell out to operator-supplied commands.
//!
//! Both receive the task (and for the launcher, agent and session) ids through
//! `CONDUCTOR_*` environment variables.

mod launcher;
mod verifier;

pub use launcher::ProcessLauncher;
pub use verifier::CommandVerifier;

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::domain::models::CommandConfig;

pub const ENV_TASK_ID: &str = "CONDUCTOR_TASK_ID";
pub const ENV_AGENT_ID: &str = "CONDUCTOR_AGENT_ID";
pub const ENV_SESSION_ID: &str = "CONDUCTOR_SESSION_ID";

/// Exit status a launch command uses to report an upstream rate limit
/// (`EX_TEMPFAIL`).
pub const EXIT_RATE_LIMITED: i32 = 75;

fn base_command(config: &CommandConfig) -> Command {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

fn timeout_of(config: &CommandConfig) -> Option<Duration> {
    (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs))
}
