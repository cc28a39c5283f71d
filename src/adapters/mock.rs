//! Scripted collaborators for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::ports::{
    LaunchResult, Notifier, NotifyError, VerificationError, VerificationReport, Verifier,
    WorkerLauncher,
};

/// Launcher that replays scripted results, then succeeds.
#[derive(Default)]
pub struct MockLauncher {
    script: Mutex<VecDeque<LaunchResult>>,
    launches: Mutex<Vec<(Uuid, Uuid)>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for the next launch.
    pub fn push(&self, result: LaunchResult) {
        self.script.lock().push_back(result);
    }

    /// `(task_id, agent_id)` for every launch, in order.
    pub fn launches(&self) -> Vec<(Uuid, Uuid)> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch_worker(&self, task_id: Uuid, agent_id: Uuid) -> LaunchResult {
        self.launches.lock().push((task_id, agent_id));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| LaunchResult::Started {
                session_id: Uuid::new_v4(),
            })
    }
}

/// One scripted verifier outcome.
#[derive(Debug, Clone)]
pub enum MockVerdict {
    Report(VerificationReport),
    Error(String),
    Panic,
}

/// Verifier that replays scripted verdicts, then passes.
pub struct MockVerifier {
    script: Mutex<VecDeque<MockVerdict>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self::with_delay(Duration::ZERO)
    }
}

impl MockVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each verification sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, verdict: MockVerdict) {
        self.script.lock().push_back(verdict);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `verify` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    async fn verify(&self, _task_id: Uuid) -> Result<VerificationReport, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let verdict = self.script.lock().pop_front();
        match verdict {
            None => Ok(VerificationReport::passed("ok").with_check("mock", true)),
            Some(MockVerdict::Report(report)) => Ok(report),
            Some(MockVerdict::Error(msg)) => Err(VerificationError::Unavailable(msg)),
            Some(MockVerdict::Panic) => panic!("scripted verifier panic"),
        }
    }
}

/// Notifier that keeps every message.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}
