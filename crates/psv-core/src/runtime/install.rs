use psv_common::{Error, PluginId, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::PluginRuntime;
use crate::audit::AuditAction;
use crate::plugin::manifest::is_semver;
use crate::plugin::{load_manifest, materialize_environment, PluginDescriptor, PluginInstance};

/// Removes a fetched package when dropped.
struct TempPackage(PathBuf);

impl Drop for TempPackage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), error = %e, "failed to remove temporary package"),
        }
    }
}

impl PluginRuntime {
    /// Fetch, extract, validate and verify a plugin, then register it as
    /// `Installed`. On failure nothing is registered and the plugin
    /// directory is removed.
    pub fn install(&self, descriptor: &PluginDescriptor) -> Result<()> {
        let result = self.install_inner(descriptor);
        let details = serde_json::json!({
            "name": descriptor.name,
            "version": descriptor.version,
            "source": descriptor.source,
        });
        self.audit_outcome(AuditAction::Install, &descriptor.id, details, &result);
        result
    }

    fn install_inner(&self, descriptor: &PluginDescriptor) -> Result<()> {
        let plugin_id = PluginId::parse(&descriptor.id)?;
        // The version names the temporary package file.
        if !is_semver(&descriptor.version) {
            return Err(Error::ManifestInvalid {
                plugin_id: plugin_id.to_string(),
                reason: format!("requested version {:?} is not MAJOR.MINOR.PATCH", descriptor.version),
            });
        }
        let reservation = self
            .registry
            .reserve(&plugin_id)
            .map_err(|_| Error::AlreadyInstalled {
                plugin_id: plugin_id.to_string(),
            })?;

        let plugin_dir = self.config.plugins_root.join(plugin_id.as_str());
        prepare_plugin_dir(&plugin_id, &plugin_dir)?;

        match self.build_instance(&plugin_id, descriptor, &plugin_dir) {
            Ok(instance) => {
                reservation.commit(instance);
                info!(%plugin_id, version = %descriptor.version, dir = %plugin_dir.display(), "plugin installed");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_dir_all(&plugin_dir) {
                    warn!(%plugin_id, dir = %plugin_dir.display(), error = %rm, "failed to clean up plugin directory");
                }
                warn!(%plugin_id, error = %e, "plugin install failed");
                Err(e)
            }
        }
    }

    fn build_instance(
        &self,
        plugin_id: &PluginId,
        descriptor: &PluginDescriptor,
        plugin_dir: &Path,
    ) -> Result<PluginInstance> {
        let id = plugin_id.to_string();

        std::fs::create_dir_all(&self.config.temp_root)?;
        let package = TempPackage(
            self.config
                .temp_root
                .join(format!("{id}-{}.pkg", descriptor.version)),
        );

        self.fetcher
            .fetch(&descriptor.source, &package.0)
            .map_err(|e| Error::FetchFailed {
                plugin_id: id.clone(),
                reason: e.to_string(),
            })?;
        debug!(%plugin_id, package = %package.0.display(), "package fetched");

        let extracted = self.extractor.extract(&package.0, plugin_dir);
        drop(package);
        extracted.map_err(|e| Error::ExtractFailed {
            plugin_id: id.clone(),
            reason: e.to_string(),
        })?;

        let resolved = load_manifest(plugin_dir).map_err(|e| Error::ManifestInvalid {
            plugin_id: id.clone(),
            reason: e.to_string(),
        })?;
        let manifest = &resolved.manifest;
        if manifest.id != id {
            return Err(Error::ManifestInvalid {
                plugin_id: id,
                reason: format!("manifest declares id {:?}", manifest.id),
            });
        }
        if manifest.version != descriptor.version {
            return Err(Error::ManifestInvalid {
                plugin_id: id,
                reason: format!(
                    "manifest version {} does not match requested {}",
                    manifest.version, descriptor.version
                ),
            });
        }

        let report = self
            .verifier
            .verify(&resolved)
            .map_err(|e| Error::VerificationFailed {
                plugin_id: id.clone(),
                reason: e.to_string(),
            })?;
        debug!(%plugin_id, signer = ?report.signer, unverified = report.unverified, "plugin admitted");

        let environment =
            materialize_environment(&id, plugin_dir, &manifest.version, &descriptor.config);
        Ok(PluginInstance::new(
            plugin_id.clone(),
            resolved.manifest,
            plugin_dir.to_path_buf(),
            descriptor.config.clone(),
            environment,
        ))
    }
}

/// Create an empty plugin directory, clearing leftovers from a previous
/// process that never uninstalled.
fn prepare_plugin_dir(plugin_id: &PluginId, plugin_dir: &Path) -> Result<()> {
    if plugin_dir.exists() {
        warn!(%plugin_id, dir = %plugin_dir.display(), "removing stale plugin directory");
        std::fs::remove_dir_all(plugin_dir)?;
    }
    std::fs::create_dir_all(plugin_dir)?;
    Ok(())
}
