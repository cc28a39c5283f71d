pub mod event_bus;
pub mod expiring_set;
pub mod qa_service;
pub mod rate_limit_backoff;
pub mod retry_handler;
pub mod scanners;
pub mod spawn_service;
pub mod stuck_agent_handler;
pub mod task_state_machine;

pub use event_bus::{BusStats, Envelope, Event, EventBus, EventHandler, EventKind, Subscription};
pub use expiring_set::ExpiringSet;
pub use qa_service::{QaService, QaStatus};
pub use rate_limit_backoff::{BackoffPolicy, BackoffStatus, RateLimitBackoff};
pub use retry_handler::FailedTaskRetryHandler;
pub use scanners::{PeriodicScanner, Scanner, ScannerStatus};
pub use spawn_service::{SpawnService, SpawnStatus};
pub use stuck_agent_handler::{StuckAgentHandler, StuckOutcome};
pub use task_state_machine::{TaskStateMachine, TransitionContext, TransitionError};
