use chrono::Utc;
use psv_common::{Error, ErrorKind, PluginId, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::process::{LaunchRequest, ProcessHandle, StopOutcome};
use super::{known_id, not_found, PluginRuntime};
use crate::audit::AuditAction;
use crate::plugin::{materialize_environment, PluginStatus};

/// What stop decided to do while holding the lock.
enum StopPlan {
    Terminate(Arc<ProcessHandle>),
    /// Nothing left to wait for; state was already released.
    Released(Option<Arc<ProcessHandle>>),
}

impl PluginRuntime {
    /// Launch the plugin's entry point. Allowed from `Installed`, `Stopped`
    /// and `Error`.
    pub fn start(&self, id: &str) -> Result<()> {
        let result = self.start_inner(id);
        let details = match &result {
            Ok(pid) => serde_json::json!({ "pid": pid }),
            Err(_) => serde_json::json!({}),
        };
        self.audit_outcome(AuditAction::Start, id, details, &result);
        result.map(|_| ())
    }

    fn start_inner(&self, id: &str) -> Result<u32> {
        let plugin_id = known_id(id)?;
        let (manifest, plugin_dir, environment) = self
            .registry
            .with_instance(&plugin_id, |instance| {
                if instance.status == PluginStatus::Running {
                    return Err(already_running(&plugin_id));
                }
                Ok((
                    Arc::clone(&instance.manifest),
                    instance.plugin_dir.clone(),
                    instance.environment.clone(),
                ))
            })
            .ok_or_else(|| not_found(id))??;

        let handle = Arc::new(ProcessHandle::spawn(LaunchRequest {
            plugin_id: &plugin_id,
            plugin_dir: &plugin_dir,
            entry: &manifest.entry,
            args: &manifest.args,
            environment: &environment,
            inherit_env: &self.config.launch.inherit_env,
            log_path: self.log_path(&plugin_id),
        })?);

        let now = Utc::now();
        let committed = self.registry.with_instance(&plugin_id, |instance| {
            if instance.status == PluginStatus::Running {
                return Err(already_running(&plugin_id));
            }
            instance.process = Some(Arc::clone(&handle));
            instance.status = PluginStatus::Running;
            instance.start_time = Some(now);
            instance.last_health_check = Some(now);
            Ok(())
        });

        match committed {
            Some(Ok(())) => {
                info!(%plugin_id, pid = handle.pid(), log = %handle.log_path().display(), "plugin started");
                Ok(handle.pid())
            }
            Some(Err(e)) => {
                warn!(%plugin_id, pid = handle.pid(), "plugin started concurrently; discarding new process");
                handle.discard();
                Err(e)
            }
            None => {
                warn!(%plugin_id, pid = handle.pid(), "plugin removed during start; discarding new process");
                handle.discard();
                Err(not_found(id))
            }
        }
    }

    /// Stop a running plugin: stop signal, grace period, then SIGKILL.
    /// From `Error` this only releases leftover state.
    pub fn stop(&self, id: &str) -> Result<()> {
        let result = self.stop_inner(id);
        let details = match &result {
            Ok(Some(outcome)) => outcome.details(),
            Ok(None) => serde_json::json!({ "forced": false }),
            Err(_) => serde_json::json!({}),
        };
        self.audit_outcome(AuditAction::Stop, id, details, &result);
        result.map(|_| ())
    }

    fn stop_inner(&self, id: &str) -> Result<Option<StopOutcome>> {
        let plugin_id = known_id(id)?;
        let plan = self
            .registry
            .with_instance(&plugin_id, |instance| match instance.status {
                PluginStatus::Running => match instance.process.clone() {
                    Some(handle) => {
                        instance.stopping = true;
                        Ok(StopPlan::Terminate(handle))
                    }
                    None => {
                        instance.status = PluginStatus::Stopped;
                        Ok(StopPlan::Released(None))
                    }
                },
                PluginStatus::Error => {
                    instance.status = PluginStatus::Stopped;
                    Ok(StopPlan::Released(instance.process.take()))
                }
                PluginStatus::Installed | PluginStatus::Stopped => Err(Error::NotRunning {
                    plugin_id: plugin_id.to_string(),
                }),
            })
            .ok_or_else(|| not_found(id))??;

        let handle = match plan {
            StopPlan::Terminate(handle) => handle,
            StopPlan::Released(leftover) => {
                if let Some(handle) = leftover {
                    let outcome = handle.terminate(&plugin_id, &self.config.stop);
                    handle.close_log();
                    if outcome.exit.is_none() {
                        handle.reap_in_background(&plugin_id);
                    }
                }
                info!(%plugin_id, "plugin stopped");
                return Ok(None);
            }
        };

        let outcome = handle.terminate(&plugin_id, &self.config.stop);
        handle.close_log();
        if outcome.exit.is_none() {
            Arc::clone(&handle).reap_in_background(&plugin_id);
        }

        let released = self.registry.with_instance(&plugin_id, |instance| {
            if !instance.holds(&handle) {
                return false;
            }
            instance.process = None;
            instance.stopping = false;
            instance.status = PluginStatus::Stopped;
            true
        });
        if released != Some(true) {
            debug!(%plugin_id, "instance changed while stopping; leaving it as is");
        }

        info!(
            %plugin_id,
            pid = handle.pid(),
            forced = outcome.forced,
            exit = ?outcome.exit,
            "plugin stopped"
        );
        Ok(Some(outcome))
    }
}

impl PluginRuntime {
    /// Stop the plugin if it is running, then start it again. The restart
    /// is counted once the start step is reached, whether or not it works.
    pub fn restart(&self, id: &str) -> Result<()> {
        let result = self.restart_inner(id);
        let details = match &result {
            Ok(count) => serde_json::json!({ "restart_count": count }),
            Err(_) => serde_json::json!({}),
        };
        self.audit_outcome(AuditAction::Restart, id, details, &result);
        result.map(|_| ())
    }

    fn restart_inner(&self, id: &str) -> Result<u32> {
        let plugin_id = known_id(id)?;
        let status = self
            .registry
            .status(&plugin_id)
            .ok_or_else(|| not_found(id))?;
        if status == PluginStatus::Running {
            self.stop(id)?;
        }

        let count = self
            .registry
            .with_instance(&plugin_id, |instance| {
                instance.restart_count = instance.restart_count.saturating_add(1);
                instance.restart_count
            })
            .ok_or_else(|| not_found(id))?;
        info!(%plugin_id, restart_count = count, "restarting plugin");
        self.start(id)?;
        Ok(count)
    }

    /// Replace the plugin's config and rebuild its environment. The new
    /// environment applies from the next start; a running process keeps
    /// the one it was launched with.
    pub fn update_config(
        &self,
        id: &str,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        // Values may be secrets; only the keys are audited.
        let keys: Vec<String> = config.keys().cloned().collect();
        let result = self.update_config_inner(id, config);
        self.audit_outcome(
            AuditAction::ConfigUpdate,
            id,
            serde_json::json!({ "keys": keys }),
            &result,
        );
        result
    }

    fn update_config_inner(
        &self,
        id: &str,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let plugin_id = known_id(id)?;
        let running = self
            .registry
            .with_instance(&plugin_id, |instance| {
                instance.environment = materialize_environment(
                    plugin_id.as_str(),
                    &instance.plugin_dir,
                    &instance.manifest.version,
                    &config,
                );
                instance.config = config;
                instance.status == PluginStatus::Running
            })
            .ok_or_else(|| not_found(id))?;
        info!(%plugin_id, applies_on_restart = running, "plugin config updated");
        Ok(())
    }

    /// Stop every running plugin, best effort. Plugins stay installed.
    /// Returns the last stop failure, if any.
    pub fn shutdown(&self) -> Result<()> {
        let running: Vec<PluginId> = self
            .registry
            .running()
            .into_iter()
            .map(|(plugin_id, _)| plugin_id)
            .collect();
        info!(count = running.len(), "stopping all running plugins");

        let mut last_failure = None;
        for plugin_id in running {
            match self.stop(plugin_id.as_str()) {
                Ok(()) => {}
                // Stopped, crashed or removed since the sweep began.
                Err(e) if matches!(e.kind(), ErrorKind::NotRunning | ErrorKind::NotFound) => {
                    debug!(%plugin_id, error = %e, "plugin already down");
                }
                Err(e) => {
                    error!(%plugin_id, error = %e, "failed to stop plugin during shutdown");
                    last_failure = Some(e);
                }
            }
        }
        last_failure.map_or(Ok(()), Err)
    }
}

fn already_running(plugin_id: &PluginId) -> Error {
    Error::AlreadyRunning {
        plugin_id: plugin_id.to_string(),
    }
}
