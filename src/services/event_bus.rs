//! EventBus service for typed publish/subscribe between components.
//!
//! Every event is a variant of the closed [`Event`] enum. Publishing stamps
//! it with a bus-wide [`SequenceNumber`] and fans it out to one mailbox per
//! subscriber. Each subscriber is a single-owner task that runs its handler
//! on one envelope at a time, so events of a given kind reach a subscriber in
//! publish order. Handler errors and panics are logged and never reach the
//! publisher or other subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::models::TransitionSource;

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every fact the orchestrator announces. One variant per event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Task lifecycle
    TaskPending {
        task_id: Uuid,
    },
    TaskStarted {
        task_id: Uuid,
        agent_id: Option<Uuid>,
        session_id: Option<Uuid>,
    },
    TaskReadyForQa {
        task_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        error: Option<String>,
        source: TransitionSource,
    },
    TaskBlocked {
        task_id: Uuid,
        reason: Option<String>,
        source: TransitionSource,
    },

    // Agents
    AgentStuck {
        agent_id: Uuid,
        reason: String,
    },
    AgentWorking {
        agent_id: Uuid,
        task_id: Uuid,
    },
    AgentIdle {
        agent_id: Uuid,
    },

    // Worker sessions
    SessionStarted {
        session_id: Uuid,
        task_id: Uuid,
        agent_id: Uuid,
    },
    SessionEnded {
        session_id: Uuid,
        task_id: Uuid,
        agent_id: Uuid,
    },

    // Host load, edge-triggered
    SystemCpuHigh {
        percent: f64,
    },
    SystemCpuNormal {
        percent: f64,
    },
    SystemMemoryHigh {
        percent: f64,
    },
    SystemMemoryNormal {
        percent: f64,
    },
    SystemShutdown,

    // Schedules
    SchedulePlanningDue {
        boundary: DateTime<Utc>,
    },
}

/// Fieldless discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventKind {
    TaskPending,
    TaskStarted,
    TaskReadyForQa,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    AgentStuck,
    AgentWorking,
    AgentIdle,
    SessionStarted,
    SessionEnded,
    SystemCpuHigh,
    SystemCpuNormal,
    SystemMemoryHigh,
    SystemMemoryNormal,
    SystemShutdown,
    SchedulePlanningDue,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        Self::TaskPending,
        Self::TaskStarted,
        Self::TaskReadyForQa,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskBlocked,
        Self::AgentStuck,
        Self::AgentWorking,
        Self::AgentIdle,
        Self::SessionStarted,
        Self::SessionEnded,
        Self::SystemCpuHigh,
        Self::SystemCpuNormal,
        Self::SystemMemoryHigh,
        Self::SystemMemoryNormal,
        Self::SystemShutdown,
        Self::SchedulePlanningDue,
    ];

    /// Namespaced event name, e.g. `task:ready_for_qa`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskPending => "task:pending",
            Self::TaskStarted => "task:started",
            Self::TaskReadyForQa => "task:ready_for_qa",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskBlocked => "task:blocked",
            Self::AgentStuck => "agent:stuck",
            Self::AgentWorking => "agent:working",
            Self::AgentIdle => "agent:idle",
            Self::SessionStarted => "session:started",
            Self::SessionEnded => "session:ended",
            Self::SystemCpuHigh => "system:cpu_high",
            Self::SystemCpuNormal => "system:cpu_normal",
            Self::SystemMemoryHigh => "system:memory_high",
            Self::SystemMemoryNormal => "system:memory_normal",
            Self::SystemShutdown => "system:shutdown",
            Self::SchedulePlanningDue => "schedule:planning_due",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskPending { .. } => EventKind::TaskPending,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::TaskReadyForQa { .. } => EventKind::TaskReadyForQa,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskBlocked { .. } => EventKind::TaskBlocked,
            Self::AgentStuck { .. } => EventKind::AgentStuck,
            Self::AgentWorking { .. } => EventKind::AgentWorking,
            Self::AgentIdle { .. } => EventKind::AgentIdle,
            Self::SessionStarted { .. } => EventKind::SessionStarted,
            Self::SessionEnded { .. } => EventKind::SessionEnded,
            Self::SystemCpuHigh { .. } => EventKind::SystemCpuHigh,
            Self::SystemCpuNormal { .. } => EventKind::SystemCpuNormal,
            Self::SystemMemoryHigh { .. } => EventKind::SystemMemoryHigh,
            Self::SystemMemoryNormal { .. } => EventKind::SystemMemoryNormal,
            Self::SystemShutdown => EventKind::SystemShutdown,
            Self::SchedulePlanningDue { .. } => EventKind::SchedulePlanningDue,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskPending { task_id }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskReadyForQa { task_id }
            | Self::TaskCompleted { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskBlocked { task_id, .. }
            | Self::AgentWorking { task_id, .. }
            | Self::SessionStarted { task_id, .. }
            | Self::SessionEnded { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// A published event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Reactive event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one event. An `Err` is logged by the bus.
    async fn handle(&self, envelope: &Envelope) -> Result<(), String>;
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Events published per name since the bus was created
    pub published: BTreeMap<&'static str, u64>,
    pub total_published: u64,
    /// Live handler subscriptions
    pub subscribers: usize,
    /// Live passive watchers
    pub watchers: usize,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Envelope>,
}

struct Watcher {
    kinds: HashSet<EventKind>,
    sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
    watchers: Vec<Watcher>,
    published: HashMap<EventKind, u64>,
    next_id: u64,
    sequence: u64,
}

/// Central event bus. Construct once and share as `Arc<EventBus>`.
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    handler_failures: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            handler_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to every current subscriber of its kind.
    ///
    /// Never blocks and never fails; handlers run on their own tasks.
    pub fn publish(&self, event: Event) -> SequenceNumber {
        let kind = event.kind();
        let mut registry = self.registry.lock();

        let sequence = SequenceNumber(registry.sequence);
        registry.sequence += 1;
        *registry.published.entry(kind).or_insert(0) += 1;

        let envelope = Envelope {
            sequence,
            timestamp: Utc::now(),
            event,
        };

        if let Some(subscribers) = registry.subscribers.get_mut(&kind) {
            // A closed mailbox means the subscriber task is gone.
            subscribers.retain(|s| s.sender.send(envelope.clone()).is_ok());
        }
        registry
            .watchers
            .retain(|w| !w.kinds.contains(&kind) || w.sender.send(envelope.clone()).is_ok());

        debug!(event = kind.name(), sequence = %sequence, "Published event");
        sequence
    }

    /// Register `handler` for one event kind. Must be called from within a
    /// tokio runtime. The handler stays registered until the returned
    /// subscription is unsubscribed or `remove_all` is called.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .subscribers
                .entry(kind)
                .or_default()
                .push(Subscriber { id, sender });
            id
        };

        tokio::spawn(run_subscriber(
            kind,
            handler,
            receiver,
            Arc::clone(&self.handler_failures),
        ));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Subscribe one handler to several kinds.
    pub fn subscribe_many(
        &self,
        kinds: &[EventKind],
        handler: &Arc<dyn EventHandler>,
    ) -> Vec<Subscription> {
        kinds
            .iter()
            .map(|kind| self.subscribe(*kind, Arc::clone(handler)))
            .collect()
    }

    /// Passive stream of every event whose kind is in `kinds`. Dropping the
    /// receiver ends the watch.
    pub fn watch(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Envelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry.lock().watchers.push(Watcher {
            kinds: kinds.iter().copied().collect(),
            sender,
        });
        receiver
    }

    /// Drop every subscription and watcher. Subscriber tasks finish the
    /// envelopes already queued and then exit.
    pub fn remove_all(&self) {
        let mut registry = self.registry.lock();
        let count: usize = registry.subscribers.values().map(Vec::len).sum();
        registry.subscribers.clear();
        registry.watchers.clear();
        debug!(subscriptions = count, "Removed all bus subscriptions");
    }

    pub fn stats(&self) -> BusStats {
        let registry = self.registry.lock();
        BusStats {
            published: registry
                .published
                .iter()
                .map(|(kind, count)| (kind.name(), *count))
                .collect(),
            total_published: registry.sequence,
            subscribers: registry.subscribers.values().map(Vec::len).sum(),
            watchers: registry.watchers.len(),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of events of `kind` published so far.
    pub fn published_count(&self, kind: EventKind) -> u64 {
        self.registry
            .lock()
            .published
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove this subscription. Safe to call after `remove_all` or after
    /// the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(subscribers) = registry.lock().subscribers.get_mut(&self.kind) {
                subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}

async fn run_subscriber(
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
    failures: Arc<AtomicU64>,
) {
    while let Some(envelope) = receiver.recv().await {
        let outcome = AssertUnwindSafe(handler.handle(&envelope))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handler = handler.name(),
                    event = kind.name(),
                    sequence = %envelope.sequence,
                    error = %e,
                    "Event handler failed"
                );
            }
            Err(panic) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    handler = handler.name(),
                    event = kind.name(),
                    sequence = %envelope.sequence,
                    panic = %panic_message(panic.as_ref()),
                    "Event handler panicked"
                );
            }
        }
    }
    debug!(handler = handler.name(), event = kind.name(), "Subscriber stopped");
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
