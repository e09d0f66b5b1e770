// Engine configuration: every section defaults, a YAML file overrides
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classifier::ErrorKind;
use crate::error::{ConfigError, ReboundError, Result};
use crate::escalation::EscalationConfig;
use crate::executor::{ExecutorConfig, TimeoutConfig, DEFAULT_LOOP_WINDOW};
use crate::healing::LearnerConfig;
use crate::health::HealthConfig;
use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::logging::utils::config_loading_span;
use crate::retry::{PolicyTable, RetryPolicyOverride};

/// Environment variable that relocates the data directory
pub const HOME_ENV: &str = "REBOUND_HOME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub capacity: usize,
    /// Consecutive failed rounds of one task that count as a loop
    pub loop_window: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LEDGER_CAPACITY,
            loop_window: DEFAULT_LOOP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds `strategies.db` plus `runs/` and `archive/`
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured directory, else `$REBOUND_HOME`, else the platform data dir
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        dirs::data_dir()
            .map(|dir| dir.join("rebound"))
            .ok_or_else(|| {
                ReboundError::Config(Box::new(ConfigError::DataDirectory {
                    message: format!("no platform data directory; set {HOME_ENV}"),
                }))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub ledger: LedgerConfig,
    pub escalation: EscalationConfig,
    pub timeouts: TimeoutConfig,
    pub learner: LearnerConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
    /// Sparse per-kind overrides merged over the built-in policy table
    pub policies: HashMap<ErrorKind, RetryPolicyOverride>,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let _span = config_loading_span(path).entered();
        if !path.exists() {
            return Err(ReboundError::Config(Box::new(ConfigError::NotFound {
                path: path.to_path_buf(),
                suggestion: Some("Omit --config to run with built-in defaults".to_string()),
            })));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_context(&content, Some(path))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_context(yaml, None)
    }

    fn from_yaml_with_context(yaml: &str, path: Option<&Path>) -> Result<Self> {
        // an empty document means "all defaults"
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| {
                let mut config_error = *Box::<ConfigError>::from(e);
                if let ConfigError::InvalidYaml { file_path, .. } = &mut config_error {
                    *file_path = path.map(Path::to_path_buf);
                }
                ReboundError::Config(Box::new(config_error))
            })?
        };

        config.validate()?;
        debug!(overrides = config.policies.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        positive("executor.concurrency", self.executor.concurrency as f64)?;
        positive("executor.checkpoint_every", self.executor.checkpoint_every as f64)?;
        positive("circuit_breaker.threshold", self.circuit_breaker.threshold as f64)?;
        positive("circuit_breaker.window_ms", self.circuit_breaker.window_ms as f64)?;
        positive("circuit_breaker.cooloff_ms", self.circuit_breaker.cooloff_ms as f64)?;
        if self.circuit_breaker.max_cooloff_ms < self.circuit_breaker.cooloff_ms {
            return Err(invalid(
                "circuit_breaker.max_cooloff_ms",
                self.circuit_breaker.max_cooloff_ms.to_string(),
                "at least circuit_breaker.cooloff_ms",
            ));
        }
        positive("ledger.capacity", self.ledger.capacity as f64)?;
        positive("escalation.attempt_threshold", self.escalation.attempt_threshold as f64)?;
        unit_interval("learner.confidence_threshold", self.learner.confidence_threshold)?;
        unit_interval("learner.ema_weight", self.learner.ema_weight)?;
        unit_interval("timeouts.latency_weight", self.timeouts.latency_weight)?;
        unit_interval("health.failure_ratio_alarm", self.health.failure_ratio_alarm)?;
        if self.timeouts.ceiling_multiplier < 1.0 {
            return Err(invalid(
                "timeouts.ceiling_multiplier",
                self.timeouts.ceiling_multiplier.to_string(),
                "a multiplier of at least 1.0",
            ));
        }

        for (kind, policy) in &self.policies {
            if let (Some(base), Some(max)) = (policy.base_delay_ms, policy.max_delay_ms) {
                if base > max {
                    return Err(invalid(
                        &format!("policies.{kind}.base_delay_ms"),
                        base.to_string(),
                        "no more than max_delay_ms",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Built-in policies with this file's overrides applied
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::default().with_overrides(&self.policies)
    }
}

fn invalid(field: &str, value: String, expected: &str) -> ReboundError {
    ReboundError::Config(Box::new(ConfigError::InvalidValue {
        message: format!("{field} is out of range"),
        field: field.to_string(),
        value,
        expected: expected.to_string(),
    }))
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, value.to_string(), "a value greater than zero"))
    }
}

fn unit_interval(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, value.to_string(), "a value between 0.0 and 1.0"))
    }
}
