//! Audit trail for lifecycle operations.
//!
//! Every lifecycle operation (install, start, stop, restart, config update,
//! uninstall) emits one [`AuditEvent`], successful or not. Sinks are
//! pluggable and can be combined with [`AuditFanout`]; the runtime never
//! fails an operation because its audit record could not be written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write audit record: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Install,
    Start,
    Stop,
    Restart,
    ConfigUpdate,
    Uninstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, plugin_id: &str, details: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            resource: "plugin".to_string(),
            resource_id: plugin_id.to_string(),
            details,
            result: AuditResult::Success,
            error_code: None,
        }
    }

    /// Mark the event as failed with the taxonomy code of `error`.
    pub fn failed(mut self, error: &psv_common::Error) -> Self {
        self.result = AuditResult::Failure;
        self.error_code = Some(error.code());
        self
    }
}

pub trait AuditLogger: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonlAuditLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLogger {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let open_err = |source| AuditError::Open {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLogger for JsonlAuditLogger {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Emits events on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let details = serde_json::to_string(&event.details)?;
        info!(
            target: "audit",
            event_id = %event.event_id,
            action = ?event.action,
            resource = %event.resource,
            resource_id = %event.resource_id,
            result = ?event.result,
            error_code = ?event.error_code,
            details = %details,
            "audit"
        );
        Ok(())
    }
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Forwards each event to every registered sink. All sinks are tried; the
/// last failure is returned.
#[derive(Default)]
pub struct AuditFanout {
    sinks: Vec<Box<dyn AuditLogger>>,
}

impl AuditFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AuditLogger + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn AuditLogger>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditLogger for AuditFanout {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut last_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}
