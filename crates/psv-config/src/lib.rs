//! Plugin supervisor configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for the supervisor configuration file
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation

pub mod resolve;
pub mod supervisor;
pub mod validate;

pub use resolve::{resolve_config, resolve_config_path, ConfigPaths, ConfigSource};
pub use supervisor::{
    AuditConfig, ConfigError, HealthConfig, LaunchConfig, StopConfig, StopSignal,
    SupervisorConfig, VerificationConfig, VerificationMode,
};
pub use validate::{validate, ValidationError};

/// Directory name used under the platform config/data directories.
pub const APP_DIR_NAME: &str = "plugin_supervisor";
