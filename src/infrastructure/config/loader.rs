use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Directory holding project-local configuration and state.
pub const CONFIG_DIR: &str = ".conductor";

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "CONDUCTOR_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("{0} must be at least 1")]
    ZeroConcurrency(&'static str),

    #[error(
        "Invalid {resource} thresholds: normal ({normal}) must be below high ({high}) and both within 0-100"
    )]
    InvalidHysteresis {
        resource: &'static str,
        high: f64,
        normal: f64,
    },

    #[error("Invalid backoff configuration: base_ms ({0}) must not exceed max_ms ({1})")]
    InvalidBackoff(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the project in the current directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .conductor/config.yaml
    /// 3. .conductor/local.yaml (optional overrides)
    /// 4. Environment variables (CONDUCTOR_* prefix)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same as [`load`](Self::load) with the project rooted at `root`.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Config> {
        let dir = root.as_ref().join(CONFIG_DIR);
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load one explicit file over the defaults. Environment overrides still
    /// apply.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        let intervals = [
            ("resources.sample_interval_secs", config.resources.sample_interval_secs),
            ("scanners.pending_interval_secs", config.scanners.pending_interval_secs),
            ("scanners.ready_for_qa_interval_secs", config.scanners.ready_for_qa_interval_secs),
            ("scanners.stuck_interval_secs", config.scanners.stuck_interval_secs),
            ("scanners.stall_threshold_secs", config.scanners.stall_threshold_secs),
            ("scanners.planning_interval_secs", config.scanners.planning_interval_secs),
            ("scanners.planning_period_mins", config.scanners.planning_period_mins),
            ("scanners.cleanup_interval_secs", config.scanners.cleanup_interval_secs),
            ("backoff.base_ms", config.backoff.base_ms),
            ("backoff.window_secs", config.backoff.window_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }

        if config.qa.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency("qa.max_concurrent"));
        }
        if config.spawn.max_concurrent_workers == 0 {
            return Err(ConfigError::ZeroConcurrency("spawn.max_concurrent_workers"));
        }
        if config.qa.max_attempts == 0 {
            return Err(ConfigError::ZeroConcurrency("qa.max_attempts"));
        }
        if config.recovery.stuck_retry_ceiling == 0 {
            return Err(ConfigError::ZeroConcurrency("recovery.stuck_retry_ceiling"));
        }
        if config.backoff.escalation_threshold == 0 {
            return Err(ConfigError::ZeroConcurrency("backoff.escalation_threshold"));
        }

        check_hysteresis(
            "cpu",
            config.resources.cpu_high_percent,
            config.resources.cpu_normal_percent,
        )?;
        check_hysteresis(
            "memory",
            config.resources.memory_high_percent,
            config.resources.memory_normal_percent,
        )?;

        if config.backoff.base_ms > config.backoff.max_ms {
            return Err(ConfigError::InvalidBackoff(
                config.backoff.base_ms,
                config.backoff.max_ms,
            ));
        }

        if config.qa.agent_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "qa.agent_name cannot be empty".to_string(),
            ));
        }
        if config.notifications.channel.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "notifications.channel cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_hysteresis(resource: &'static str, high: f64, normal: f64) -> Result<(), ConfigError> {
    let in_range = |v: f64| (0.0..=100.0).contains(&v);
    if normal < high && in_range(high) && in_range(normal) {
        Ok(())
    } else {
        Err(ConfigError::InvalidHysteresis {
            resource,
            high,
            normal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project_with(config_yaml: Option<&str>, local_yaml: Option<&str>) -> TempDir {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&conf).unwrap();
        if let Some(yaml) = config_yaml {
            fs::write(conf.join("config.yaml"), yaml).unwrap();
        }
        if let Some(yaml) = local_yaml {
            fs::write(conf.join("local.yaml"), yaml).unwrap();
        }
        dir
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, ".conductor/conductor.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.qa.max_concurrent, 1);
        assert_eq!(config.recovery.stuck_retry_ceiling, 5);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing_keeps_defaults_for_missing_keys() {
        let yaml = r"
database:
  path: /custom/path.db
resources:
  cpu_high_percent: 90
  cpu_normal_percent: 50
scanners:
  stall_threshold_secs: 120
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 5);
        assert!((config.resources.cpu_high_percent - 90.0).abs() < f64::EPSILON);
        assert!((config.resources.memory_high_percent - 85.0).abs() < f64::EPSILON);
        assert_eq!(config.scanners.stall_threshold_secs, 120);
        assert_eq!(config.scanners.pending_interval_secs, 10);
        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_hierarchical_merging() {
        let dir = project_with(
            Some("logging:\n  level: info\n  format: json\nspawn:\n  max_concurrent_workers: 2\n"),
            Some("logging:\n  level: debug\n"),
        );

        let config = temp_env::with_vars_unset(
            ["CONDUCTOR_LOGGING__LEVEL", "CONDUCTOR_SPAWN__MAX_CONCURRENT_WORKERS"],
            || ConfigLoader::load_from_dir(dir.path()),
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug", "local.yaml should win");
        assert_eq!(config.logging.format, "json", "base value should persist");
        assert_eq!(config.spawn.max_concurrent_workers, 2);
    }

    #[test]
    fn test_env_override_wins() {
        let dir = project_with(Some("qa:\n  max_attempts: 2\n"), None);

        let config = temp_env::with_vars(
            [
                ("CONDUCTOR_QA__MAX_ATTEMPTS", Some("7")),
                ("CONDUCTOR_BACKOFF__BASE_MS", Some("1000")),
            ],
            || ConfigLoader::load_from_dir(dir.path()),
        )
        .unwrap();

        assert_eq!(config.qa.max_attempts, 7);
        assert_eq!(config.backoff.base_ms, 1000);
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(ConfigLoader::load_from_file(dir.path().join("nope.yaml")).is_err());
    }

    #[test]
    fn test_invalid_file_is_rejected_by_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "spawn:\n  max_concurrent_workers: 0\n").unwrap();
        let err = ConfigLoader::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("spawn.max_concurrent_workers"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.scanners.stuck_interval_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroInterval("scanners.stuck_interval_secs"))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_hysteresis() {
        let mut config = Config::default();
        config.resources.memory_normal_percent = 85.0;
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidHysteresis { resource, .. }) => assert_eq!(resource, "memory"),
            other => panic!("expected InvalidHysteresis, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "loud"),
            other => panic!("expected InvalidLogLevel, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.backoff.base_ms = 1_000_000;
        config.backoff.max_ms = 1_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(1_000_000, 1_000))
        ));
    }
}
