pub mod agent;
pub mod config;
pub mod task;

pub use agent::{Agent, AgentRole, AgentStatus};
pub use config::{
    BackoffConfig, CommandConfig, Config, DatabaseConfig, LoggingConfig, NotificationConfig,
    QaConfig, RecoveryConfig, ResourceConfig, ScannerConfig, SpawnConfig,
};
pub use task::{Task, TaskPriority, TaskStatus, TransitionSource};
