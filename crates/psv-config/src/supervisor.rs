//! Supervisor configuration model.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::APP_DIR_NAME;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] crate::validate::ValidationError),
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root under which each plugin gets `<plugins_root>/<id>/`.
    pub plugins_root: PathBuf,
    /// Holds downloaded packages and `<id>.log` subprocess logs.
    pub temp_root: PathBuf,
    pub stop: StopConfig,
    pub health: HealthConfig,
    pub verification: VerificationConfig,
    pub audit: AuditConfig,
    pub launch: LaunchConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let data = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            plugins_root: data.join(APP_DIR_NAME).join("plugins"),
            temp_root: std::env::temp_dir().join(APP_DIR_NAME),
            stop: StopConfig::default(),
            health: HealthConfig::default(),
            verification: VerificationConfig::default(),
            audit: AuditConfig::default(),
            launch: LaunchConfig::default(),
        }
    }
}

/// Signal sent to ask a plugin to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopSignal::Terminate => write!(f, "SIGTERM"),
            StopSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Graceful-then-forced termination timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Wait after the stop signal before force-killing.
    pub grace_period_ms: u64,
    /// Bounded wait for a force-killed process to be reaped.
    pub kill_timeout_ms: u64,
    /// Exit polling interval while waiting.
    pub poll_interval_ms: u64,
    pub signal: StopSignal,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            kill_timeout_ms: 5_000,
            poll_interval_ms: 50,
            signal: StopSignal::Terminate,
        }
    }
}

impl StopConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Whether trust policy is applied at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Enforce,
    /// Every plugin is admitted; each admission is logged as a warning.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub mode: VerificationMode,
    /// Reject manifests without a `checksum`.
    pub require_checksum: bool,
    /// Reject manifests without a `signature`.
    pub require_signature: bool,
    /// Base64-encoded SEC1 P-256 public keys, newest first.
    pub trusted_keys: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            mode: VerificationMode::Enforce,
            require_checksum: true,
            require_signature: false,
            trusted_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL audit file. When unset, audit events go to the `audit`
    /// tracing target.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Host environment variables passed through to plugin processes.
    /// Everything else is cleared before the plugin environment is applied.
    pub inherit_env: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            inherit_env: vec!["PATH".to_string()],
        }
    }
}

impl SupervisorConfig {
    /// Load a config file, choosing the format by extension (`.json` is
    /// JSON, anything else TOML), and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: SupervisorConfig = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        };

        crate::validate::validate(&config)?;
        Ok(config)
    }

    /// Apply `PSV_PLUGINS_ROOT` / `PSV_TEMP_ROOT` style overrides.
    ///
    /// Takes a lookup function so tests do not need to mutate the process
    /// environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PSV_PLUGINS_ROOT").filter(|v| !v.is_empty()) {
            self.plugins_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("PSV_TEMP_ROOT").filter(|v| !v.is_empty()) {
            self.temp_root = PathBuf::from(root);
        }
    }

    /// Config rooted entirely under `base`, with the production defaults for
    /// everything else. Used by tests and the `run` command's scratch mode.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            plugins_root: base.join("plugins"),
            temp_root: base.join("tmp"),
            ..Self::default()
        }
    }
}
