//! Notifier that writes operator messages to the log.

use async_trait::async_trait;

use crate::domain::ports::{Notifier, NotifyError};

/// Delivers notifications as `warn` level log records. Used when no chat
/// integration is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifyError> {
        tracing::warn!(channel = %channel, notification = %message, "Operator notification");
        Ok(())
    }
}
