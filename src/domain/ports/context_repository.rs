use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Expiring key/value context shared with workers.
#[async_trait]
pub trait ContextRepository: Send + Sync {
    /// Store a value that expires after `ttl_secs`.
    async fn put(&self, key: &str, value: &str, ttl_secs: i64) -> DomainResult<()>;

    /// Fetch a value that has not yet expired.
    async fn get(&self, key: &str) -> DomainResult<Option<String>>;

    /// Delete every expired entry and return how many were removed.
    async fn prune_expired(&self) -> DomainResult<u64>;
}
