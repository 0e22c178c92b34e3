use psv_common::{Error, Result};
use tracing::{info, warn};

use super::{known_id, not_found, PluginRuntime};
use crate::audit::AuditAction;
use crate::plugin::PluginStatus;

impl PluginRuntime {
    /// Stop if running, delete the plugin directory, then drop the registry
    /// entry. If the directory cannot be removed the entry stays.
    pub fn uninstall(&self, id: &str) -> Result<()> {
        let result = self.uninstall_inner(id);
        self.audit_outcome(AuditAction::Uninstall, id, serde_json::json!({}), &result);
        result
    }

    fn uninstall_inner(&self, id: &str) -> Result<()> {
        let plugin_id = known_id(id)?;
        let (status, plugin_dir) = self
            .registry
            .with_instance(&plugin_id, |instance| {
                (instance.status, instance.plugin_dir.clone())
            })
            .ok_or_else(|| not_found(id))?;

        if status == PluginStatus::Running {
            if let Err(e) = self.stop(id) {
                warn!(%plugin_id, error = %e, "stop before uninstall failed; continuing");
            }
        }

        match std::fs::remove_dir_all(&plugin_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%plugin_id, dir = %plugin_dir.display(), "plugin directory already gone");
            }
            Err(e) => {
                return Err(Error::DirectoryRemovalFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: format!("{}: {e}", plugin_dir.display()),
                })
            }
        }

        if let Some(instance) = self.registry.remove(&plugin_id) {
            // Started by someone else after our stop.
            if let Some(handle) = instance.process {
                warn!(%plugin_id, pid = handle.pid(), "plugin restarted during uninstall; killing it");
                handle.discard();
            }
        }
        info!(%plugin_id, "plugin uninstalled");
        Ok(())
    }
}
