//! Periodic scanners.
//!
//! A scanner reads persisted state and turns interesting conditions into bus
//! events. It never writes task or agent records. [`PeriodicScanner`] runs one
//! scanner on a fixed interval and keeps the status the facade reports.

pub mod cleanup;
pub mod pending_task;
pub mod planning;
pub mod ready_for_qa;
pub mod stuck_agent;

pub use cleanup::CleanupScanner;
pub use pending_task::PendingTaskScanner;
pub use planning::PlanningScanner;
pub use ready_for_qa::ReadyForQaScanner;
pub use stuck_agent::StuckAgentScanner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::errors::DomainResult;
use crate::services::event_bus::panic_message;

/// One poll of persisted state.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns how many conditions were reported.
    async fn poll(&self) -> DomainResult<usize>;
}

/// Snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub name: &'static str,
    pub running: bool,
    pub interval_secs: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub polls: u64,
    pub failures: u64,
    pub last_reported: usize,
    pub total_reported: u64,
}

#[derive(Debug, Default)]
struct PollStats {
    last_poll_at: Option<DateTime<Utc>>,
    polls: u64,
    failures: u64,
    last_reported: usize,
    total_reported: u64,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs a [`Scanner`] on a timer. Start and stop are idempotent.
pub struct PeriodicScanner {
    scanner: Arc<dyn Scanner>,
    interval: Duration,
    stats: Arc<Mutex<PollStats>>,
    running: Mutex<Option<Running>>,
}

impl PeriodicScanner {
    pub fn new(scanner: Arc<dyn Scanner>, interval: Duration) -> Self {
        Self {
            scanner,
            interval,
            stats: Arc::new(Mutex::new(PollStats::default())),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.scanner.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Poll once outside the timer.
    pub async fn poll_now(&self) -> DomainResult<usize> {
        run_poll(self.scanner.as_ref(), &self.stats).await
    }

    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let scanner = Arc::clone(&self.scanner);
        let stats = Arc::clone(&self.stats);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(scanner = scanner.name(), interval_secs = period.as_secs(), "Scanner started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match AssertUnwindSafe(run_poll(scanner.as_ref(), &stats)).catch_unwind().await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(scanner = scanner.name(), error = %e, "Scanner poll failed"),
                            Err(panic) => {
                                stats.lock().failures += 1;
                                error!(
                                    scanner = scanner.name(),
                                    panic = %panic_message(panic.as_ref()),
                                    "Scanner poll panicked"
                                );
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            info!(scanner = scanner.name(), "Scanner stopped");
        });

        *running = Some(Running {
            shutdown_tx,
            handle,
        });
    }

    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(scanner = self.name(), error = %e, "Scanner task ended abnormally");
        }
    }

    pub fn status(&self) -> ScannerStatus {
        let running = self.is_running();
        let stats = self.stats.lock();
        ScannerStatus {
            name: self.name(),
            running,
            interval_secs: self.interval.as_secs(),
            last_poll_at: stats.last_poll_at,
            polls: stats.polls,
            failures: stats.failures,
            last_reported: stats.last_reported,
            total_reported: stats.total_reported,
        }
    }
}

async fn run_poll(scanner: &dyn Scanner, stats: &Mutex<PollStats>) -> DomainResult<usize> {
    let result = scanner.poll().await;
    let mut stats = stats.lock();
    stats.last_poll_at = Some(Utc::now());
    stats.polls += 1;
    match &result {
        Ok(reported) => {
            stats.last_reported = *reported;
            stats.total_reported += *reported as u64;
            if *reported > 0 {
                debug!(scanner = scanner.name(), reported, "Scanner reported conditions");
            }
        }
        Err(_) => stats.failures += 1,
    }
    result
}
