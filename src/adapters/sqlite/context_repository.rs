//! SQLite implementation of the ContextRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::format_datetime;
use crate::domain::errors::DomainResult;
use crate::domain::ports::ContextRepository;

#[derive(Clone)]
pub struct SqliteContextRepository {
    pool: SqlitePool,
}

impl SqliteContextRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContextRepository for SqliteContextRepository {
    async fn put(&self, key: &str, value: &str, ttl_secs: i64) -> DomainResult<()> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);

        sqlx::query(
            r"INSERT INTO context_entries (key, value, expires_at, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(format_datetime(expires_at))
        .bind(format_datetime(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> DomainResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM context_entries WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(format_datetime(Utc::now()))
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn prune_expired(&self) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM context_entries WHERE expires_at <= ?")
            .bind(format_datetime(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    #[tokio::test]
    async fn test_prune_removes_only_expired_entries() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteContextRepository::new(pool);

        repo.put("stale", "old", -60).await.unwrap();
        repo.put("fresh", "new", 3600).await.unwrap();

        assert!(repo.get("stale").await.unwrap().is_none());
        assert_eq!(repo.prune_expired().await.unwrap(), 1);
        assert_eq!(repo.get("fresh").await.unwrap().as_deref(), Some("new"));
        assert_eq!(repo.prune_expired().await.unwrap(), 0);
    }
}
