//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `rascal.toml` in the working directory. Every field has a
//! default so the file is optional. Environment variables take precedence
//! over file values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use rascal_adapter_virtual::DeviceSpec;
use rascal_app::estimator::EstimatorConfig;
use rascal_app::factory::RoutineDefinition;
use rascal_app::runtime::RuntimeConfig;
use rascal_app::scheduler::SchedulerConfig;
use rascal_domain::policy::SchedulingPolicy;
use rascal_domain::script::Step;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSection,
    pub estimator: EstimatorSection,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// Simulated devices.
    pub devices: Vec<DeviceSpec>,
    /// JSON file of routines triggered at start-up.
    pub routines: Option<PathBuf>,
}

/// Scheduling policy and admission tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub policy: SchedulingPolicy,
    /// Failed wait-queue retries before a routine is dropped.
    pub wait_ttl: u32,
    /// Estimate used for a device without history.
    pub default_duration_ms: u64,
    /// Grace period past the scheduled end before a device counts as failed.
    pub detection_timeout_ms: u64,
    /// Finished routines kept for the schedule metrics.
    pub metrics_retention: usize,
}

/// Duration estimation tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EstimatorSection {
    pub slo: f64,
    pub worst_case_delta_secs: f64,
    pub history_limit: usize,
}

/// `SQLite` database configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `SQLite` connection URL or file path.
    pub url: String,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Content of the routines file.
#[derive(Debug, Default, Deserialize)]
pub struct RoutineFile {
    /// Script library, called with `service: script.<name>`.
    #[serde(default)]
    pub scripts: HashMap<String, Vec<Step>>,
    pub routines: Vec<RoutineDefinition>,
}

impl RoutineFile {
    /// Read a routines file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(ConfigError::Routines)
    }
}

impl Config {
    /// Load configuration from `rascal.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if a
    /// value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("rascal.toml")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("RASCAL_POLICY") {
            self.scheduler.policy = val
                .parse()
                .map_err(|_| ConfigError::Validation(format!("unknown scheduling policy {val}")))?;
        }
        if let Ok(val) = std::env::var("RASCAL_DATABASE_URL") {
            self.database.url = val;
        }
        if let Ok(val) = std::env::var("RASCAL_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.estimator.slo > 0.0 && self.estimator.slo < 1.0) {
            return Err(ConfigError::Validation("slo must be within (0, 1)".to_string()));
        }
        if !self.estimator.worst_case_delta_secs.is_finite() || self.estimator.worst_case_delta_secs <= 0.0 {
            return Err(ConfigError::Validation("worst_case_delta_secs must be positive".to_string()));
        }
        if self.estimator.history_limit == 0 {
            return Err(ConfigError::Validation("history_limit must be non-zero".to_string()));
        }
        if self.scheduler.metrics_retention == 0 {
            return Err(ConfigError::Validation("metrics_retention must be non-zero".to_string()));
        }
        if self.scheduler.default_duration_ms == 0 {
            return Err(ConfigError::Validation("default_duration_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Runtime settings, with the scripts of the routines file.
    #[must_use]
    pub fn runtime_config(&self, scripts: HashMap<String, Vec<Step>>) -> RuntimeConfig {
        let defaults = EstimatorConfig::default();
        RuntimeConfig {
            scheduler: SchedulerConfig {
                policy: self.scheduler.policy,
                wait_ttl: self.scheduler.wait_ttl,
                metrics_retention: self.scheduler.metrics_retention,
                detection_timeout: TimeDelta::milliseconds(
                    i64::try_from(self.scheduler.detection_timeout_ms).unwrap_or(i64::MAX),
                ),
                ..SchedulerConfig::default()
            },
            estimator: EstimatorConfig {
                slo: self.estimator.slo,
                worst_case_delta: Duration::try_from_secs_f64(self.estimator.worst_case_delta_secs)
                    .unwrap_or(defaults.worst_case_delta),
                history_limit: self.estimator.history_limit,
                default_duration: Duration::from_millis(self.scheduler.default_duration_ms),
            },
            scripts,
        }
    }

    /// Return the database URL in `sqlx`-compatible format.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database.url
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::default(),
            wait_ttl: 10,
            default_duration_ms: 1_000,
            detection_timeout_ms: 5_000,
            metrics_retention: 1_000,
        }
    }
}

impl Default for EstimatorSection {
    fn default() -> Self {
        Self {
            slo: 0.95,
            worst_case_delta_secs: 2.0,
            history_limit: 100,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:rascal.db?mode=rwc".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "rascald=info,rascal=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// The routines file is not valid JSON.
    #[error("failed to parse routines file")]
    Routines(#[source] serde_json::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.policy, SchedulingPolicy::Fcfs);
        assert_eq!(config.scheduler.wait_ttl, 10);
        assert_eq!(config.database.url, "sqlite:rascal.db?mode=rwc");
        assert!(config.devices.is_empty());
        assert!(config.routines.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            routines = 'routines.json'

            [scheduler]
            policy = 'fcfs_post'
            wait_ttl = 3
            default_duration_ms = 250
            detection_timeout_ms = 1500
            metrics_retention = 50

            [estimator]
            slo = 0.9
            worst_case_delta_secs = 0.5
            history_limit = 20

            [database]
            url = 'sqlite:test.db'

            [logging]
            filter = 'debug'

            [[devices]]
            entity_id = 'light.kitchen'
            duration_ms = 400

            [[devices]]
            entity_id = 'sensor.door'
            polled = true
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.scheduler.policy, SchedulingPolicy::FcfsPost);
        assert_eq!(config.scheduler.wait_ttl, 3);
        assert_eq!(config.scheduler.metrics_retention, 50);
        assert_eq!(config.estimator.history_limit, 20);
        assert_eq!(config.database_url(), "sqlite:test.db");
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.devices.len(), 2);
        assert!(config.devices[1].polled);
        assert_eq!(config.routines, Some(PathBuf::from("routines.json")));
    }

    #[test]
    fn should_keep_section_defaults_when_toml_is_partial() {
        let config: Config = toml::from_str("[scheduler]\npolicy = 'jit'").unwrap();
        assert_eq!(config.scheduler.policy, SchedulingPolicy::Jit);
        assert_eq!(config.scheduler.detection_timeout_ms, 5_000);
        assert!((config.estimator.slo - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn should_reject_unknown_policy_when_parsing() {
        let result: Result<Config, _> = toml::from_str("[scheduler]\npolicy = 'lottery'");
        assert!(result.is_err());
    }

    #[test]
    fn should_return_default_when_file_not_found() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.scheduler.wait_ttl, 10);
    }

    #[test]
    fn should_reject_slo_when_out_of_range() {
        let mut config = Config::default();
        config.estimator.slo = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_zero_history_limit() {
        let mut config = Config::default();
        config.estimator.history_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_convert_units_when_building_runtime_config() {
        let mut config = Config::default();
        config.scheduler.policy = SchedulingPolicy::Timeline;
        config.scheduler.detection_timeout_ms = 1_500;
        config.scheduler.default_duration_ms = 250;
        config.estimator.worst_case_delta_secs = 0.5;

        let runtime = config.runtime_config(HashMap::new());

        assert_eq!(runtime.scheduler.policy, SchedulingPolicy::Timeline);
        assert_eq!(runtime.scheduler.detection_timeout, TimeDelta::milliseconds(1_500));
        assert_eq!(runtime.estimator.default_duration, Duration::from_millis(250));
        assert_eq!(runtime.estimator.worst_case_delta, Duration::from_millis(500));
    }

    #[test]
    fn should_parse_routine_file_with_scripts() {
        let json = serde_json::json!({
            "scripts": {
                "dim": [{"service": "light.turn_on", "target": {"entity_id": "light.a"}}]
            },
            "routines": [
                {"name": "evening", "steps": [{"service": "script.dim"}]}
            ]
        });

        let file: RoutineFile = serde_json::from_value(json).unwrap();

        assert!(file.scripts.contains_key("dim"));
        assert_eq!(file.routines[0].name, "evening");
    }
}
