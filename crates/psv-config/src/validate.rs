//! Semantic validation of a [`SupervisorConfig`].

use crate::supervisor::{SupervisorConfig, VerificationMode};

/// A configuration value that parses but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration field {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate cross-field constraints. Returns the first violation found.
pub fn validate(config: &SupervisorConfig) -> Result<(), ValidationError> {
    if config.plugins_root.as_os_str().is_empty() {
        return Err(ValidationError::new("plugins_root", "must not be empty"));
    }
    if config.temp_root.as_os_str().is_empty() {
        return Err(ValidationError::new("temp_root", "must not be empty"));
    }
    if config.plugins_root == config.temp_root {
        return Err(ValidationError::new(
            "temp_root",
            "must differ from plugins_root",
        ));
    }

    let stop = &config.stop;
    if stop.grace_period_ms == 0 {
        return Err(ValidationError::new(
            "stop.grace_period_ms",
            "must be greater than 0",
        ));
    }
    if stop.poll_interval_ms == 0 {
        return Err(ValidationError::new(
            "stop.poll_interval_ms",
            "must be greater than 0",
        ));
    }
    if stop.poll_interval_ms > stop.grace_period_ms {
        return Err(ValidationError::new(
            "stop.poll_interval_ms",
            format!(
                "must not exceed stop.grace_period_ms ({})",
                stop.grace_period_ms
            ),
        ));
    }
    if stop.kill_timeout_ms == 0 {
        return Err(ValidationError::new(
            "stop.kill_timeout_ms",
            "must be greater than 0",
        ));
    }

    if config.health.interval_secs == 0 {
        return Err(ValidationError::new(
            "health.interval_secs",
            "must be greater than 0",
        ));
    }

    let verification = &config.verification;
    if verification.mode == VerificationMode::Enforce
        && verification.require_signature
        && verification.trusted_keys.is_empty()
    {
        return Err(ValidationError::new(
            "verification.trusted_keys",
            "require_signature is set but no trusted keys are configured",
        ));
    }

    if config
        .launch
        .inherit_env
        .iter()
        .any(|name| name.is_empty() || name.contains('='))
    {
        return Err(ValidationError::new(
            "launch.inherit_env",
            "variable names must be non-empty and must not contain '='",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_is_valid() {
        assert!(validate(&SupervisorConfig::default()).is_ok());
    }

    #[test]
    fn test_equal_roots_rejected() {
        let mut config = SupervisorConfig::default();
        config.temp_root = config.plugins_root.clone();
        assert_eq!(validate(&config).unwrap_err().field, "temp_root");
    }

    #[test]
    fn test_empty_root_rejected() {
        let mut config = SupervisorConfig::default();
        config.plugins_root = PathBuf::new();
        assert_eq!(validate(&config).unwrap_err().field, "plugins_root");
    }

    #[test]
    fn test_poll_longer_than_grace_rejected() {
        let mut config = SupervisorConfig::default();
        config.stop.grace_period_ms = 100;
        config.stop.poll_interval_ms = 200;
        assert_eq!(validate(&config).unwrap_err().field, "stop.poll_interval_ms");
    }

    #[test]
    fn test_zero_kill_timeout_rejected() {
        let mut config = SupervisorConfig::default();
        config.stop.kill_timeout_ms = 0;
        assert_eq!(validate(&config).unwrap_err().field, "stop.kill_timeout_ms");
    }

    #[test]
    fn test_signature_without_keys_rejected() {
        let mut config = SupervisorConfig::default();
        config.verification.require_signature = true;
        assert_eq!(
            validate(&config).unwrap_err().field,
            "verification.trusted_keys"
        );

        config.verification.mode = VerificationMode::Disabled;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_inherit_env_rejected() {
        let mut config = SupervisorConfig::default();
        config.launch.inherit_env.push("A=B".to_string());
        assert_eq!(validate(&config).unwrap_err().field, "launch.inherit_env");
    }
}
