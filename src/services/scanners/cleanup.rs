use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::Scanner;
use crate::domain::errors::DomainResult;
use crate::domain::ports::ContextRepository;

/// Sweeps expired context entries. Logs only; nothing is published.
pub struct CleanupScanner {
    context: Arc<dyn ContextRepository>,
}

impl CleanupScanner {
    pub fn new(context: Arc<dyn ContextRepository>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Scanner for CleanupScanner {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn poll(&self) -> DomainResult<usize> {
        let pruned = self.context.prune_expired().await?;
        if pruned > 0 {
            info!(pruned, "Pruned expired context entries");
        }
        Ok(usize::try_from(pruned).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteContextRepository};

    #[tokio::test]
    async fn test_prunes_expired_entries() {
        let pool = create_migrated_test_pool().await.unwrap();
        let context: Arc<dyn ContextRepository> = Arc::new(SqliteContextRepository::new(pool));
        context.put("stale", "x", -10).await.unwrap();
        context.put("fresh", "y", 3600).await.unwrap();

        let scanner = CleanupScanner::new(Arc::clone(&context));
        assert_eq!(scanner.poll().await.unwrap(), 1);
        assert_eq!(scanner.poll().await.unwrap(), 0);
        assert_eq!(context.get("fresh").await.unwrap().as_deref(), Some("y"));
    }
}
