//! Verifier backed by an external command.
//!
//! A JSON `VerificationReport` on stdout is used as-is. Otherwise the exit
//! status decides: 0 passes, anything else fails with stderr as the summary.

use async_trait::async_trait;
use uuid::Uuid;

use super::{base_command, timeout_of, ENV_TASK_ID};
use crate::domain::models::CommandConfig;
use crate::domain::ports::{VerificationError, VerificationReport, Verifier};

pub struct CommandVerifier {
    config: CommandConfig,
}

impl CommandVerifier {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, task_id: Uuid) -> Result<VerificationReport, VerificationError> {
        if self.config.program.is_empty() {
            return Err(VerificationError::Unavailable(
                "no verification command configured".to_string(),
            ));
        }

        let mut cmd = base_command(&self.config);
        cmd.env(ENV_TASK_ID, task_id.to_string());

        let run = cmd.output();
        let output = match timeout_of(&self.config) {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| VerificationError::Timeout(limit.as_secs()))?,
            None => run.await,
        }
        .map_err(|e| VerificationError::Unavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Ok(report) = serde_json::from_str::<VerificationReport>(stdout.trim()) {
            return Ok(report);
        }

        match output.status.code() {
            Some(0) => Ok(VerificationReport::passed(stdout.trim())),
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Ok(VerificationReport::failed(format!(
                    "verification exited with {code}: {}",
                    stderr.trim()
                )))
            }
            None => Err(VerificationError::BadOutput(
                "verification command was killed by a signal".to_string(),
            )),
        }
    }
}
