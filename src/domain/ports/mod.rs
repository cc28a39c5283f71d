//! Port trait definitions (Hexagonal Architecture)
//!
//! Adapters implement these traits; services only ever hold them as
//! `Arc<dyn ...>`:
//! - `TaskRepository` / `AgentRepository` / `ContextRepository`: the store
//! - `WorkerLauncher`: starts a worker session for a task
//! - `Verifier`: checks a worker's output
//! - `Notifier`: fire-and-forget operator messages

pub mod agent_repository;
pub mod context_repository;
pub mod launcher;
pub mod notifier;
pub mod task_repository;
pub mod verifier;

pub use agent_repository::{AgentFilter, AgentRepository};
pub use context_repository::ContextRepository;
pub use launcher::{LaunchResult, WorkerLauncher};
pub use notifier::{NotifyError, Notifier};
pub use task_repository::{TaskFilter, TaskRepository, TransitionFields, TransitionRecord};
pub use verifier::{Check, VerificationError, VerificationReport, Verifier};
