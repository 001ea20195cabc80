//! Coordinator configuration.
//!
//! TOML file (optional) -> env overrides -> validation.
//!
//! ```toml
//! log_level = "debug"
//!
//! [spool]
//! dir = "/var/lib/shardweave/spool"
//!
//! [executor]
//! max_concurrent_tasks = 32
//!
//! [executor.task_retry]
//! max_attempts = 5
//! base_delay_ms = 100
//!
//! [ddl]
//! enable_propagation = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RetryPolicy;

pub const ENV_LOG_LEVEL: &str = "SHARDWEAVE_LOG_LEVEL";
pub const ENV_SPOOL_DIR: &str = "SHARDWEAVE_SPOOL_DIR";
pub const ENV_MAX_CONCURRENT_TASKS: &str = "SHARDWEAVE_MAX_CONCURRENT_TASKS";
pub const ENV_ENABLE_DDL_PROPAGATION: &str = "SHARDWEAVE_ENABLE_DDL_PROPAGATION";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub log_level: String,
    pub spool: SpoolConfig,
    pub executor: ExecutorConfig,
    pub ddl: DdlConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Job directories are created below this directory.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on tasks the managed scheduler runs at once.
    pub max_concurrent_tasks: usize,
    pub task_retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlConfig {
    /// Propagate TRUNCATE of distributed tables to their shards.
    pub enable_propagation: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            spool: SpoolConfig::default(),
            executor: ExecutorConfig::default(),
            ddl: DdlConfig::default(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("shardweave"),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            task_retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            multiplier: 2.0,
        }
    }
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            enable_propagation: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
        )
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.merge_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides; `lookup` abstracts the environment for tests.
    pub fn merge_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(dir) = lookup(ENV_SPOOL_DIR) {
            self.spool.dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_TASKS) {
            self.executor.max_concurrent_tasks = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_MAX_CONCURRENT_TASKS}={raw} is not a number"))
            })?;
        }
        if let Some(raw) = lookup(ENV_ENABLE_DDL_PROPAGATION) {
            self.ddl.enable_propagation = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{ENV_ENABLE_DDL_PROPAGATION}={raw} is not a boolean"
                    )));
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.executor.task_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "executor.task_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.executor.task_retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "executor.task_retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.executor.max_concurrent_tasks, 16);
        assert!(config.ddl.enable_propagation);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
            [executor.task_retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.executor.task_retry.max_attempts, 5);
        assert_eq!(config.executor.task_retry.base_delay_ms, 200);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = CoordinatorConfig::from_toml_str("[executor]\nmax_concurrent_tasks = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG_LEVEL, "debug"),
            (ENV_SPOOL_DIR, "/tmp/spool-test"),
            (ENV_MAX_CONCURRENT_TASKS, "4"),
            (ENV_ENABLE_DDL_PROPAGATION, "off"),
        ]);
        let mut config = CoordinatorConfig::default();
        config
            .merge_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.spool.dir, PathBuf::from("/tmp/spool-test"));
        assert_eq!(config.executor.max_concurrent_tasks, 4);
        assert!(!config.ddl.enable_propagation);
    }

    #[test]
    fn bad_env_boolean_is_rejected() {
        let mut config = CoordinatorConfig::default();
        let err = config
            .merge_env(|key| (key == ENV_ENABLE_DDL_PROPAGATION).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("not a boolean"));
    }

    #[test]
    fn retry_config_builds_policy() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }
}
