use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Notification to {channel} failed: {reason}")]
pub struct NotifyError {
    pub channel: String,
    pub reason: String,
}

/// Outbound operator messages. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifyError>;
}
