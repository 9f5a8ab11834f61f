//! Agent configuration.
//!
//! Loaded from `~/.config/estateflow/agents.toml` by default:
//!
//! ```toml
//! health_check_interval_secs = 30
//!
//! [agents."Market Monitor"]
//! enabled = true
//! check_interval_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::runtime::{RetryPolicy, RuntimeOptions};

const MIN_INTERVAL_SECS: u64 = 1;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// Product agents and their default check intervals.
const DEFAULT_AGENTS: &[(&str, u64)] = &[
    ("Market Monitor", 300),
    ("Lead Scoring", 600),
    ("Property Watcher", 300),
    ("Campaign Optimizer", 3600),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_error_cooldown_secs() -> u64 {
    5
}

fn default_retry_base_delay_secs() -> u64 {
    60
}

fn default_agents() -> BTreeMap<String, AgentSettings> {
    DEFAULT_AGENTS
        .iter()
        .map(|(name, secs)| {
            (
                name.to_string(),
                AgentSettings {
                    enabled: true,
                    check_interval_secs: Some(*secs),
                },
            )
        })
        .collect()
}

/// Per-agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the agent's built-in interval when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_secs: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: None,
        }
    }
}

/// Partial update applied at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
}

impl AgentSettings {
    /// Merge `update`. Intervals below one second are raised to one second.
    pub fn apply(&mut self, update: &AgentConfigUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(secs) = update.check_interval_secs {
            self.check_interval_secs = Some(secs.max(MIN_INTERVAL_SECS));
        }
    }

    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSettings>,
}

/// On-disk shape: agent tables are partial.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default = "default_health_check_interval_secs")]
    health_check_interval_secs: u64,
    #[serde(default = "default_error_cooldown_secs")]
    error_cooldown_secs: u64,
    #[serde(default = "default_retry_base_delay_secs")]
    retry_base_delay_secs: u64,
    #[serde(default)]
    agents: BTreeMap<String, AgentConfigUpdate>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            agents: default_agents(),
        }
    }
}

impl AgentsConfig {
    /// Default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("estateflow").join("agents.toml"))
    }

    /// Load from `path`. A missing file yields the defaults; product agents
    /// absent from the file keep their default settings.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file. Each `[agents."<Name>"]` table only overrides the
    /// fields it sets; the rest keep the product defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut agents = default_agents();
        for (name, overrides) in file.agents {
            let settings = agents.entry(name).or_default();
            if let Some(enabled) = overrides.enabled {
                settings.enabled = enabled;
            }
            if let Some(secs) = overrides.check_interval_secs {
                settings.check_interval_secs = Some(secs);
            }
        }

        Ok(Self {
            health_check_interval_secs: file.health_check_interval_secs,
            error_cooldown_secs: file.error_cooldown_secs,
            retry_base_delay_secs: file.retry_base_delay_secs,
            agents,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "Health check interval must be at least {} second",
                MIN_INTERVAL_SECS
            )));
        }

        for (name, settings) in &self.agents {
            if let Some(secs) = settings.check_interval_secs
                && secs < MIN_INTERVAL_SECS
            {
                return Err(ConfigError::Invalid(format!(
                    "Check interval for '{}' must be at least {} second",
                    name, MIN_INTERVAL_SECS
                )));
            }
        }

        Ok(())
    }

    /// Settings for `name`; unknown agents are enabled with no override.
    pub fn settings(&self, name: &str) -> AgentSettings {
        self.agents.get(name).cloned().unwrap_or_default()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Runtime options for `name`, falling back to the built-in interval.
    pub fn runtime_options(&self, name: &str) -> RuntimeOptions {
        let interval = self
            .settings(name)
            .check_interval()
            .unwrap_or(Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS));

        RuntimeOptions::default()
            .with_check_interval(interval)
            .with_error_cooldown(Duration::from_secs(self.error_cooldown_secs))
            .with_retry(RetryPolicy::new(Duration::from_secs(
                self.retry_base_delay_secs,
            )))
    }
}
