//! Runtime record for one installed plugin.

use chrono::{DateTime, Utc};
use psv_common::PluginId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::plugin::manifest::PluginManifest;
use crate::runtime::process::ProcessHandle;

/// Lifecycle state of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Installed,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Installed => write!(f, "installed"),
            PluginStatus::Running => write!(f, "running"),
            PluginStatus::Stopped => write!(f, "stopped"),
            PluginStatus::Error => write!(f, "error"),
        }
    }
}

/// Mutable runtime record. Lives only inside the registry.
#[derive(Debug)]
pub struct PluginInstance {
    pub id: PluginId,
    pub status: PluginStatus,
    pub manifest: Arc<PluginManifest>,
    pub plugin_dir: PathBuf,
    pub config: BTreeMap<String, serde_json::Value>,
    /// Rebuilt whenever `config` changes; a running process keeps the
    /// environment it was started with.
    pub environment: BTreeMap<String, String>,
    /// Set iff `status == Running`. Only the process supervisor assigns it.
    pub(crate) process: Option<Arc<ProcessHandle>>,
    /// A stop is waiting on `process`; health checks leave it alone.
    pub(crate) stopping: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Number of `restart` calls that reached the start step.
    pub restart_count: u32,
}

impl PluginInstance {
    pub(crate) fn new(
        id: PluginId,
        manifest: PluginManifest,
        plugin_dir: PathBuf,
        config: BTreeMap<String, serde_json::Value>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            status: PluginStatus::Installed,
            manifest: Arc::new(manifest),
            plugin_dir,
            config,
            environment,
            process: None,
            stopping: false,
            start_time: None,
            last_health_check: None,
            restart_count: 0,
        }
    }

    /// Whether this instance currently holds `handle`.
    pub(crate) fn holds(&self, handle: &Arc<ProcessHandle>) -> bool {
        self.process
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Copy out the observable state.
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.to_string(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            status: self.status,
            start_time: self.start_time,
            last_health_check: self.last_health_check,
            restart_count: self.restart_count,
            pid: self.process.as_ref().map(|handle| handle.pid()),
            log_path: self
                .process
                .as_ref()
                .map(|handle| handle.log_path().to_path_buf()),
        }
    }
}

/// Point-in-time copy of an instance, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    /// OS process ID while a process handle is held.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_and_display() {
        for status in [
            PluginStatus::Installed,
            PluginStatus::Running,
            PluginStatus::Stopped,
            PluginStatus::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            let back: PluginStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }
}
