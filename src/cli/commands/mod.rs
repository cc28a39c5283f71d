//! CLI command handlers.

pub mod agent;
pub mod config;
pub mod run;
pub mod status;
pub mod task;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::adapters::sqlite::{initialize_database, PoolConfig};
use crate::domain::models::Config;

/// Open (and migrate) the configured database.
pub async fn open_database(config: &Config) -> Result<SqlitePool> {
    let pool_config = PoolConfig {
        max_connections: config.database.max_connections,
        ..PoolConfig::default()
    };
    initialize_database(&config.database.url(), Some(pool_config))
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))
}
