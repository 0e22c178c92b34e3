//! Plugin supervisor core.
//!
//! Installs plugin packages into per-plugin directories, launches each
//! plugin's entry point as a supervised subprocess, checks liveness, and
//! tears plugins down again. See [`runtime::PluginRuntime`] for the
//! operation surface.

pub mod audit;
pub mod cli;
pub mod exit_codes;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod plugin;
pub mod runtime;
pub mod verify;

pub use runtime::{Collaborators, HealthMonitor, PluginRuntime};
