//! Shared fixtures: shell-script plugins packaged as zip files under a
//! scratch directory.

#![allow(dead_code)]

use psv_config::SupervisorConfig;
use psv_core::audit::{AuditError, AuditEvent, AuditLogger};
use psv_core::plugin::{PluginDescriptor, PluginInfo, PluginStatus};
pub use psv_core::verify::checksum_files;
use psv_core::{Collaborators, PluginRuntime};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// Writes "ready" and then sleeps until signalled.
pub const SLEEPER: &str = "echo ready\nexec sleep 60";

/// Ignores the polite stop signals.
pub const STUBBORN: &str = "trap '' TERM INT\necho ready\nwhile true; do sleep 0.05; done";

/// Exits on its own shortly after starting.
pub const SHORT_LIVED: &str = "echo ready\nsleep 0.2\nexit 3";

pub struct Fixture {
    pub dir: TempDir,
    pub config: SupervisorConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = SupervisorConfig::rooted_at(dir.path());
        config.stop.grace_period_ms = 500;
        config.stop.kill_timeout_ms = 3_000;
        config.stop.poll_interval_ms = 10;
        Self { dir, config }
    }

    pub fn runtime(&self) -> PluginRuntime {
        PluginRuntime::from_config(self.config.clone()).unwrap()
    }

    pub fn runtime_with(&self, customize: impl FnOnce(Collaborators) -> Collaborators) -> PluginRuntime {
        let collaborators = Collaborators::from_config(&self.config).unwrap();
        PluginRuntime::new(self.config.clone(), customize(collaborators))
    }

    pub fn plugin_dir(&self, id: &str) -> PathBuf {
        self.config.plugins_root.join(id)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.config.temp_root.join(format!("{id}.log"))
    }

    /// Package a plugin whose entry `run.sh` runs `body`. The manifest
    /// carries the correct package checksum.
    pub fn package(&self, id: &str, body: &str) -> PluginDescriptor {
        let script = script(body);
        let manifest = serde_json::json!({
            "id": id,
            "name": format!("{id} plugin"),
            "version": "1.0.0",
            "entry": "run.sh",
            "checksum": checksum_files([("run.sh", script.as_bytes())]),
        });
        self.package_with(id, &manifest, &[("run.sh", script.as_bytes(), 0o755)])
    }

    /// Package arbitrary files next to `manifest`.
    pub fn package_with(
        &self,
        id: &str,
        manifest: &serde_json::Value,
        files: &[(&str, &[u8], u32)],
    ) -> PluginDescriptor {
        let packages = self.dir.path().join("packages");
        std::fs::create_dir_all(&packages).unwrap();
        let path = packages.join(format!("{id}.zip"));

        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("manifest.json", SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(serde_json::to_string_pretty(manifest).unwrap().as_bytes())
            .unwrap();
        for (name, data, mode) in files {
            writer
                .start_file(*name, SimpleFileOptions::default().unix_permissions(*mode))
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();

        PluginDescriptor::new(
            id,
            format!("{id} plugin"),
            manifest["version"].as_str().unwrap_or("1.0.0"),
            path.display().to_string(),
        )
    }
}

pub fn script(body: &str) -> String {
    format!("#!/bin/sh\n{body}\n")
}

/// Poll until `path` contains `needle` `count` times.
pub fn wait_for_log(path: &Path, needle: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if content.matches(needle).count() >= count {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {needle:?} in {}: {content:?}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A process handle is held exactly when the plugin is running.
pub fn assert_handle_invariant(infos: &[PluginInfo]) {
    for info in infos {
        assert_eq!(
            info.pid.is_some(),
            info.status == PluginStatus::Running,
            "handle/status mismatch for {}: {info:?}",
            info.id
        );
    }
}

/// Collects audit events for inspection.
#[derive(Clone, Default)]
pub struct RecordingAudit {
    pub events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl RecordingAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditLogger for RecordingAudit {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Rejects every record.
pub struct FailingAudit;

impl AuditLogger for FailingAudit {
    fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Write(std::io::Error::other("audit sink unavailable")))
    }
}
