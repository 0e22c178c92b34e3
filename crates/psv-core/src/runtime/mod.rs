//! The plugin runtime: install, launch, stop, health-check and remove
//! plugins, with every state change going through one [`Registry`].
//!
//! All operations are synchronous and run on the caller's thread. The
//! registry lock is held only for in-memory edits; spawning, signalling,
//! waiting and file I/O happen outside it, and any write that follows a
//! blocking step re-checks that the instance still holds the same process
//! handle.

mod health;
mod install;
mod lifecycle;
pub mod process;
mod uninstall;

pub use health::HealthMonitor;
pub use process::{LivenessFailure, ProcessHandle};

use psv_common::{Error, PluginId, Result};
use psv_config::SupervisorConfig;
use std::path::PathBuf;
use tracing::warn;

use crate::audit::{
    AuditAction, AuditEvent, AuditFanout, AuditLogger, JsonlAuditLogger, TracingAuditLogger,
};
use crate::extract::{Extractor, ZipExtractor};
use crate::fetch::{Fetcher, LocalFetcher};
use crate::plugin::{PluginInfo, PluginStatus, Registry};
use crate::verify::{verifier_from_config, Verifier};

/// The pluggable edges of the runtime.
pub struct Collaborators {
    pub fetcher: Box<dyn Fetcher>,
    pub extractor: Box<dyn Extractor>,
    pub verifier: Box<dyn Verifier>,
    pub audit: Box<dyn AuditLogger>,
}

impl Collaborators {
    /// Default implementations chosen by `config`.
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let verifier = verifier_from_config(&config.verification)
            .map_err(|e| Error::Config(format!("verification.trusted_keys: {e}")))?;
        let audit: Box<dyn AuditLogger> = match &config.audit.path {
            Some(path) => Box::new(
                JsonlAuditLogger::open(path).map_err(|e| Error::Config(e.to_string()))?,
            ),
            None => Box::new(TracingAuditLogger),
        };
        Ok(Self {
            fetcher: Box::new(LocalFetcher),
            extractor: Box::new(ZipExtractor),
            verifier,
            audit,
        })
    }

    pub fn with_fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    pub fn with_audit(mut self, audit: impl AuditLogger + 'static) -> Self {
        self.audit = Box::new(audit);
        self
    }

    /// Keep the current audit sink and also send every event to `audit`.
    pub fn add_audit(mut self, audit: impl AuditLogger + 'static) -> Self {
        let mut fanout = AuditFanout::new();
        fanout.push(self.audit);
        fanout.push(Box::new(audit));
        self.audit = Box::new(fanout);
        self
    }
}

/// Owns the registry and the collaborators.
pub struct PluginRuntime {
    config: SupervisorConfig,
    registry: Registry,
    fetcher: Box<dyn Fetcher>,
    extractor: Box<dyn Extractor>,
    verifier: Box<dyn Verifier>,
    audit: Box<dyn AuditLogger>,
}

impl PluginRuntime {
    pub fn new(config: SupervisorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            registry: Registry::new(),
            fetcher: collaborators.fetcher,
            extractor: collaborators.extractor,
            verifier: collaborators.verifier,
            audit: collaborators.audit,
        }
    }

    /// Runtime with the default collaborators for `config`.
    pub fn from_config(config: SupervisorConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::new(config, collaborators))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn get_status(&self, id: &str) -> Result<PluginStatus> {
        let plugin_id = known_id(id)?;
        self.registry
            .status(&plugin_id)
            .ok_or_else(|| not_found(id))
    }

    pub fn info(&self, id: &str) -> Result<PluginInfo> {
        let plugin_id = known_id(id)?;
        self.registry
            .info(&plugin_id)
            .ok_or_else(|| not_found(id))
    }

    /// Snapshot of every installed plugin, sorted by ID.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.registry.snapshot()
    }

    pub fn plugin_ids(&self) -> Vec<PluginId> {
        self.registry.ids()
    }

    /// `<temp_root>/<id>.log`
    pub fn log_path(&self, id: &PluginId) -> PathBuf {
        self.config.temp_root.join(format!("{id}.log"))
    }

    /// Record the outcome of `action`. Audit failures never fail the
    /// operation.
    fn audit_outcome<T>(
        &self,
        action: AuditAction,
        plugin_id: &str,
        details: serde_json::Value,
        result: &Result<T>,
    ) {
        let mut event = AuditEvent::new(action, plugin_id, details);
        if let Err(e) = result {
            event = event.failed(e);
        }
        if let Err(e) = self.audit.record(&event) {
            warn!(plugin_id, action = ?action, error = %e, "failed to write audit record");
        }
    }
}

/// Parse an ID for lookup. A malformed ID can never be registered, so it
/// reports as not found.
fn known_id(id: &str) -> Result<PluginId> {
    PluginId::parse(id).map_err(|_| not_found(id))
}

fn not_found(id: &str) -> Error {
    Error::NotFound {
        plugin_id: id.to_string(),
    }
}
