//! Host resource monitor.
//!
//! Samples CPU and memory on a fixed interval and runs each through a
//! hysteresis gate. Events are published only on the edge between `normal`
//! and `high`; consumers that need the level ask `get_state`. The monitor
//! itself never pauses anything.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::models::ResourceConfig;
use crate::services::event_bus::{Event, EventBus};

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Resource sampling unavailable: {0}")]
    Unavailable(String),
}

/// One reading, both values in percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host load readings.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<Sample, SampleError>;
}

/// Reads the host through `sysinfo`.
///
/// CPU usage is the busy share of ticks since the previous refresh, so the
/// first reading only establishes a baseline and reports 0. Memory usage is
/// `1 - available / total`.
pub struct SysinfoSampler {
    system: System,
    primed: bool,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let refresh_kind = RefreshKind::new()
            .with_cpu(CpuRefreshKind::new().with_cpu_usage())
            .with_memory(MemoryRefreshKind::new().with_ram());
        Self {
            system: System::new_with_specifics(refresh_kind),
            primed: false,
        }
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(SampleError::Unavailable("total memory reported as 0".to_string()));
        }
        #[allow(clippy::cast_precision_loss)]
        let memory_percent =
            (1.0 - self.system.available_memory() as f64 / total as f64) * 100.0;

        let cpu_percent = if self.primed {
            f64::from(self.system.global_cpu_usage())
        } else {
            self.primed = true;
            0.0
        };

        Ok(Sample {
            cpu_percent,
            memory_percent,
        })
    }
}

/// Replays a fixed list of readings, then repeats the last one.
pub struct ScriptedSampler {
    steps: VecDeque<Result<Sample, String>>,
    last: Sample,
}

impl ScriptedSampler {
    pub fn new(readings: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            steps: readings
                .into_iter()
                .map(|(cpu_percent, memory_percent)| {
                    Ok(Sample {
                        cpu_percent,
                        memory_percent,
                    })
                })
                .collect(),
            last: Sample {
                cpu_percent: 0.0,
                memory_percent: 0.0,
            },
        }
    }

    /// A host that is always idle.
    pub fn idle() -> Self {
        Self::new([])
    }

    /// Queue a failed reading.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push_back(Err(message.into()));
        self
    }

    pub fn then(mut self, cpu_percent: f64, memory_percent: f64) -> Self {
        self.steps.push_back(Ok(Sample {
            cpu_percent,
            memory_percent,
        }));
        self
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        match self.steps.pop_front() {
            Some(Ok(sample)) => {
                self.last = sample;
                Ok(sample)
            }
            Some(Err(message)) => Err(SampleError::Unavailable(message)),
            None => Ok(self.last),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    #[default]
    Normal,
    High,
}

/// Two-state machine with separate enter and exit thresholds.
#[derive(Debug, Clone)]
pub struct HysteresisGate {
    level: LoadLevel,
    high: f64,
    normal: f64,
}

impl HysteresisGate {
    /// Enter `high` at or above `high`; return to `normal` strictly below
    /// `normal`.
    pub fn new(high: f64, normal: f64) -> Self {
        Self {
            level: LoadLevel::Normal,
            high,
            normal,
        }
    }

    pub fn level(&self) -> LoadLevel {
        self.level
    }

    /// Feed one reading. Returns the new level only when it changed.
    pub fn observe(&mut self, value: f64) -> Option<LoadLevel> {
        let next = match self.level {
            LoadLevel::Normal if value >= self.high => LoadLevel::High,
            LoadLevel::High if value < self.normal => LoadLevel::Normal,
            current => current,
        };
        if next == self.level {
            None
        } else {
            self.level = next;
            Some(next)
        }
    }
}

/// Level snapshot returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceState {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub cpu: LoadLevel,
    pub memory: LoadLevel,
    pub sampled_at: Option<DateTime<Utc>>,
    pub samples: u64,
    pub sample_errors: u64,
    pub running: bool,
}

struct Gates {
    cpu: HysteresisGate,
    memory: HysteresisGate,
    cpu_percent: f64,
    memory_percent: f64,
    sampled_at: Option<DateTime<Utc>>,
    samples: u64,
    sample_errors: u64,
}

struct Inner {
    sampler: Mutex<Box<dyn ResourceSampler>>,
    gates: RwLock<Gates>,
    bus: Arc<EventBus>,
}

impl Inner {
    fn sample_once(&self) -> Result<(), SampleError> {
        let reading = self.sampler.lock().sample();
        let sample = match reading {
            Ok(sample) => sample,
            Err(e) => {
                self.gates.write().sample_errors += 1;
                return Err(e);
            }
        };

        let edges = {
            let mut gates = self.gates.write();
            gates.cpu_percent = sample.cpu_percent;
            gates.memory_percent = sample.memory_percent;
            gates.sampled_at = Some(Utc::now());
            gates.samples += 1;
            (
                gates.cpu.observe(sample.cpu_percent),
                gates.memory.observe(sample.memory_percent),
            )
        };

        debug!(
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            "Resource sample"
        );

        match edges.0 {
            Some(LoadLevel::High) => {
                warn!(cpu_percent = sample.cpu_percent, "CPU load high");
                self.bus.publish(Event::SystemCpuHigh {
                    percent: sample.cpu_percent,
                });
            }
            Some(LoadLevel::Normal) => {
                info!(cpu_percent = sample.cpu_percent, "CPU load back to normal");
                self.bus.publish(Event::SystemCpuNormal {
                    percent: sample.cpu_percent,
                });
            }
            None => {}
        }
        match edges.1 {
            Some(LoadLevel::High) => {
                warn!(memory_percent = sample.memory_percent, "Memory pressure high");
                self.bus.publish(Event::SystemMemoryHigh {
                    percent: sample.memory_percent,
                });
            }
            Some(LoadLevel::Normal) => {
                info!(memory_percent = sample.memory_percent, "Memory pressure back to normal");
                self.bus.publish(Event::SystemMemoryNormal {
                    percent: sample.memory_percent,
                });
            }
            None => {}
        }
        Ok(())
    }
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Background resource monitor.
pub struct ResourceMonitor {
    inner: Arc<Inner>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceConfig, sampler: Box<dyn ResourceSampler>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sampler: Mutex::new(sampler),
                gates: RwLock::new(Gates {
                    cpu: HysteresisGate::new(config.cpu_high_percent, config.cpu_normal_percent),
                    memory: HysteresisGate::new(
                        config.memory_high_percent,
                        config.memory_normal_percent,
                    ),
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    sampled_at: None,
                    samples: 0,
                    sample_errors: 0,
                }),
                bus,
            }),
            interval: config.sample_interval(),
            running: Mutex::new(None),
        }
    }

    /// Take one reading now. On error the previous levels are kept.
    pub fn sample_once(&self) -> Result<(), SampleError> {
        self.inner.sample_once()
    }

    pub fn get_state(&self) -> ResourceState {
        let gates = self.inner.gates.read();
        ResourceState {
            cpu_percent: gates.cpu_percent,
            memory_percent: gates.memory_percent,
            cpu: gates.cpu.level(),
            memory: gates.memory.level(),
            sampled_at: gates.sampled_at,
            samples: gates.samples,
            sample_errors: gates.sample_errors,
            running: self.is_running(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start sampling in the background. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let inner = Arc::clone(&self.inner);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(interval_secs = period.as_secs(), "Resource monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = inner.sample_once() {
                            warn!(error = %e, "Resource sample failed; keeping previous state");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            info!("Resource monitor stopped");
        });

        *running = Some(Running {
            shutdown_tx,
            handle,
        });
    }

    /// Stop sampling and wait for the loop to exit. No-op if not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Resource monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventKind;

    fn monitor_with(sampler: ScriptedSampler) -> (ResourceMonitor, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let monitor = ResourceMonitor::new(
            &ResourceConfig::default(),
            Box::new(sampler),
            Arc::clone(&bus),
        );
        (monitor, bus)
    }

    #[test]
    fn test_gate_only_reports_edges() {
        let mut gate = HysteresisGate::new(80.0, 60.0);
        let edges: Vec<_> = [50.0, 85.0, 85.0, 65.0, 55.0]
            .into_iter()
            .map(|v| gate.observe(v))
            .collect();
        assert_eq!(
            edges,
            vec![None, Some(LoadLevel::High), None, None, Some(LoadLevel::Normal)]
        );
    }

    #[test]
    fn test_gate_does_not_oscillate_inside_band() {
        let mut gate = HysteresisGate::new(80.0, 60.0);
        assert_eq!(gate.observe(81.0), Some(LoadLevel::High));
        for v in [79.0, 61.0, 75.0, 60.0, 70.0] {
            assert_eq!(gate.observe(v), None);
        }
        assert_eq!(gate.level(), LoadLevel::High);
    }

    #[tokio::test]
    async fn test_cpu_sequence_emits_one_high_and_one_normal() {
        let sampler = ScriptedSampler::new([
            (50.0, 10.0),
            (85.0, 10.0),
            (85.0, 10.0),
            (65.0, 10.0),
            (55.0, 10.0),
        ]);
        let (monitor, bus) = monitor_with(sampler);
        let mut rx = bus.watch(&[EventKind::SystemCpuHigh, EventKind::SystemCpuNormal]);

        let mut kinds_after_each = Vec::new();
        for _ in 0..5 {
            monitor.sample_once().unwrap();
            let mut kinds = Vec::new();
            while let Ok(envelope) = rx.try_recv() {
                kinds.push(envelope.event.kind());
            }
            kinds_after_each.push(kinds);
        }

        assert_eq!(
            kinds_after_each,
            vec![
                vec![],
                vec![EventKind::SystemCpuHigh],
                vec![],
                vec![],
                vec![EventKind::SystemCpuNormal],
            ]
        );
        assert_eq!(bus.published_count(EventKind::SystemMemoryHigh), 0);
    }

    #[tokio::test]
    async fn test_memory_gate_is_independent() {
        let sampler = ScriptedSampler::new([(10.0, 90.0), (90.0, 60.0)]);
        let (monitor, bus) = monitor_with(sampler);

        monitor.sample_once().unwrap();
        let state = monitor.get_state();
        assert_eq!(state.memory, LoadLevel::High);
        assert_eq!(state.cpu, LoadLevel::Normal);

        monitor.sample_once().unwrap();
        let state = monitor.get_state();
        assert_eq!(state.memory, LoadLevel::Normal);
        assert_eq!(state.cpu, LoadLevel::High);
        assert_eq!(bus.published_count(EventKind::SystemMemoryHigh), 1);
        assert_eq!(bus.published_count(EventKind::SystemMemoryNormal), 1);
        assert_eq!(bus.published_count(EventKind::SystemCpuHigh), 1);
    }

    #[tokio::test]
    async fn test_sample_error_keeps_previous_state() {
        let sampler = ScriptedSampler::new([(90.0, 10.0)]).then_fail("procfs gone");
        let (monitor, bus) = monitor_with(sampler);

        monitor.sample_once().unwrap();
        assert!(monitor.sample_once().is_err());

        let state = monitor.get_state();
        assert_eq!(state.cpu, LoadLevel::High);
        assert!((state.cpu_percent - 90.0).abs() < f64::EPSILON);
        assert_eq!(state.samples, 1);
        assert_eq!(state.sample_errors, 1);
        assert_eq!(bus.stats().total_published, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let bus = Arc::new(EventBus::new());
        let config = ResourceConfig {
            sample_interval_secs: 1,
            ..Default::default()
        };
        let monitor = ResourceMonitor::new(&config, Box::new(ScriptedSampler::idle()), bus);

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.get_state().samples >= 1);

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_sysinfo_first_sample_is_baseline() {
        let mut sampler = SysinfoSampler::new();
        let first = sampler.sample().unwrap();
        assert!(first.cpu_percent.abs() < f64::EPSILON);
        assert!((0.0..=100.0).contains(&first.memory_percent));
    }
}
