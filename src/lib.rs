//! Conductor - event-driven task orchestrator
//!
//! Conductor drives tasks through a fixed lifecycle
//! (`pending → in_progress → ready_for_qa → completed`, with `failed` and
//! `blocked` on the side). Periodic scanners detect work and stalls, and
//! reactive services dispatch workers, verify results and recover stuck
//! agents. All coordination goes through a typed event bus; every status
//! change goes through the task state machine.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and port traits
//! - **Adapters** (`adapters`): SQLite store, external commands, notifiers
//! - **Service Layer** (`services`): event bus, state machine, reactive services, scanners
//! - **Application Layer** (`application`): resource monitor and the `EventSystem` facade
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use conductor::application::{EventSystem, EventSystemDeps};
//! use conductor::adapters::sqlite::initialize_database;
//! use conductor::infrastructure::config::ConfigLoader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let pool = initialize_database(&config.database.url(), None).await?;
//!     let system = EventSystem::new(config.clone(), EventSystemDeps::production(pool, &config));
//!     system.init().await?;
//!     tokio::signal::ctrl_c().await?;
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{EventSystem, EventSystemDeps, SystemStatus};
pub use domain::models::{Agent, AgentRole, AgentStatus, Config, Task, TaskStatus, TransitionSource};
pub use domain::ports::{AgentRepository, TaskRepository};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{Event, EventBus, EventKind, TaskStateMachine};
