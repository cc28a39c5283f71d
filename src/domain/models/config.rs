use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Conductor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Host load sampling and backpressure thresholds
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Poll intervals for the scanners
    #[serde(default)]
    pub scanners: ScannerConfig,

    /// Verification queue
    #[serde(default)]
    pub qa: QaConfig,

    /// Worker dispatch
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Stuck-agent recovery and retry budgets
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Rate-limit backoff policy
    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".conductor/conductor.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling JSON log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Resource monitor configuration. Percentages are 0-100.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceConfig {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_cpu_high")]
    pub cpu_high_percent: f64,
    #[serde(default = "default_cpu_normal")]
    pub cpu_normal_percent: f64,
    #[serde(default = "default_memory_high")]
    pub memory_high_percent: f64,
    #[serde(default = "default_memory_normal")]
    pub memory_normal_percent: f64,
}

const fn default_sample_interval_secs() -> u64 {
    10
}

const fn default_cpu_high() -> f64 {
    80.0
}

const fn default_cpu_normal() -> f64 {
    60.0
}

const fn default_memory_high() -> f64 {
    85.0
}

const fn default_memory_normal() -> f64 {
    70.0
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            cpu_high_percent: default_cpu_high(),
            cpu_normal_percent: default_cpu_normal(),
            memory_high_percent: default_memory_high(),
            memory_normal_percent: default_memory_normal(),
        }
    }
}

impl ResourceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// Scanner poll intervals and detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScannerConfig {
    #[serde(default = "default_pending_interval_secs")]
    pub pending_interval_secs: u64,

    /// A pending task is not re-announced within this window
    #[serde(default = "default_pending_reemit_secs")]
    pub pending_reemit_secs: u64,

    #[serde(default = "default_ready_for_qa_interval_secs")]
    pub ready_for_qa_interval_secs: u64,

    /// A task waiting for QA is not re-announced within this window
    #[serde(default = "default_ready_for_qa_reemit_secs")]
    pub ready_for_qa_reemit_secs: u64,

    #[serde(default = "default_stuck_interval_secs")]
    pub stuck_interval_secs: u64,

    /// Heartbeat age after which a working agent counts as stalled
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,

    #[serde(default = "default_planning_interval_secs")]
    pub planning_interval_secs: u64,

    /// Wall-clock period between planning boundaries
    #[serde(default = "default_planning_period_mins")]
    pub planning_period_mins: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

const fn default_pending_interval_secs() -> u64 {
    10
}

const fn default_pending_reemit_secs() -> u64 {
    60
}

const fn default_ready_for_qa_interval_secs() -> u64 {
    30
}

const fn default_ready_for_qa_reemit_secs() -> u64 {
    300
}

const fn default_stuck_interval_secs() -> u64 {
    60
}

const fn default_stall_threshold_secs() -> u64 {
    600
}

const fn default_planning_interval_secs() -> u64 {
    60
}

const fn default_planning_period_mins() -> u64 {
    30
}

const fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            pending_interval_secs: default_pending_interval_secs(),
            pending_reemit_secs: default_pending_reemit_secs(),
            ready_for_qa_interval_secs: default_ready_for_qa_interval_secs(),
            ready_for_qa_reemit_secs: default_ready_for_qa_reemit_secs(),
            stuck_interval_secs: default_stuck_interval_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            planning_interval_secs: default_planning_interval_secs(),
            planning_period_mins: default_planning_period_mins(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// External command configuration shared by the launcher and verifier adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CommandConfig {
    /// Program to execute; the adapter is disabled when empty
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Kill the command after this many seconds (0 = no limit)
    #[serde(default)]
    pub timeout_secs: u64,
}

/// QA service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QaConfig {
    /// Verification runs in flight at once
    #[serde(default = "default_qa_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts before a task that keeps erroring is dropped from the queue
    #[serde(default = "default_qa_max_attempts")]
    pub max_attempts: u32,

    /// Name of the verifier agent slot
    #[serde(default = "default_qa_agent_name")]
    pub agent_name: String,

    #[serde(default)]
    pub verifier: CommandConfig,
}

const fn default_qa_max_concurrent() -> usize {
    1
}

const fn default_qa_max_attempts() -> u32 {
    3
}

fn default_qa_agent_name() -> String {
    "qa".to_string()
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_qa_max_concurrent(),
            max_attempts: default_qa_max_attempts(),
            agent_name: default_qa_agent_name(),
            verifier: CommandConfig::default(),
        }
    }
}

/// Spawn service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SpawnConfig {
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,

    #[serde(default)]
    pub launcher: CommandConfig,
}

const fn default_max_concurrent_workers() -> usize {
    4
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_concurrent_workers(),
            launcher: CommandConfig::default(),
        }
    }
}

/// Stuck-agent recovery and failed-task retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Retry count at which a repeatedly stalled task is blocked
    #[serde(default = "default_stuck_retry_ceiling")]
    pub stuck_retry_ceiling: u32,

    /// Window during which a stuck agent is not handled twice
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Retry budget for tasks that fail verification
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_stuck_retry_ceiling() -> u32 {
    5
}

const fn default_debounce_secs() -> u64 {
    300
}

const fn default_max_retries() -> u32 {
    3
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_retry_ceiling: default_stuck_retry_ceiling(),
            debounce_secs: default_debounce_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Rate-limit backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackoffConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,
    /// Sliding window over which hits are counted
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Hits inside the window needed to escalate
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: usize,
}

const fn default_base_backoff_ms() -> u64 {
    60_000
}

const fn default_max_backoff_ms() -> u64 {
    900_000
}

const fn default_window_secs() -> u64 {
    300
}

const fn default_escalation_threshold() -> usize {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_backoff_ms(),
            max_ms: default_max_backoff_ms(),
            window_secs: default_window_secs(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

/// Outbound notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "ops".to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
        }
    }
}
