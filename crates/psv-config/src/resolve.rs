//! Config file resolution: CLI flag → `PSV_CONFIG` → XDG config dir →
//! built-in defaults.

use std::path::{Path, PathBuf};

use crate::supervisor::{ConfigError, SupervisorConfig};
use crate::APP_DIR_NAME;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PSV_CONFIG";

/// Config file name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Cli(PathBuf),
    Env(PathBuf),
    Xdg(PathBuf),
    Defaults,
}

/// Resolved configuration plus provenance.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub source: ConfigSource,
    pub config: SupervisorConfig,
}

/// Pick the config file to load without touching the filesystem beyond an
/// existence check for the XDG candidate.
///
/// An explicit CLI or env path is returned even if missing so that loading
/// reports the error instead of silently falling back.
pub fn resolve_config_path(
    cli: Option<&Path>,
    env_value: Option<&str>,
    config_dir: Option<&Path>,
) -> ConfigSource {
    if let Some(path) = cli {
        return ConfigSource::Cli(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return ConfigSource::Env(PathBuf::from(value));
    }
    if let Some(dir) = config_dir {
        let candidate = dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return ConfigSource::Xdg(candidate);
        }
    }
    ConfigSource::Defaults
}

/// Resolve and load the effective configuration from the real process
/// environment.
pub fn resolve_config(cli: Option<&Path>) -> Result<ConfigPaths, ConfigError> {
    let env_value = std::env::var(CONFIG_ENV_VAR).ok();
    let config_dir = dirs::config_dir();
    let source = resolve_config_path(cli, env_value.as_deref(), config_dir.as_deref());

    let mut config = match &source {
        ConfigSource::Cli(path) | ConfigSource::Env(path) | ConfigSource::Xdg(path) => {
            SupervisorConfig::load(path)?
        }
        ConfigSource::Defaults => SupervisorConfig::default(),
    };

    config.apply_env_overrides(|key| std::env::var(key).ok());
    crate::validate::validate(&config)?;

    Ok(ConfigPaths { source, config })
}
