use chrono::Utc;
use psv_common::{Error, Result};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

use super::PluginRuntime;
use crate::plugin::PluginStatus;

impl PluginRuntime {
    /// Check every running plugin once. Dead plugins move to `Error`; they
    /// are not restarted. Returns the last failure, if any.
    pub fn health_check(&self) -> Result<()> {
        let mut last_failure = None;

        for (plugin_id, handle) in self.registry.running() {
            let now = Utc::now();
            let Some(handle) = handle else {
                let flagged = self.registry.with_instance(&plugin_id, |instance| {
                    if instance.status != PluginStatus::Running || instance.process.is_some() {
                        return false;
                    }
                    instance.status = PluginStatus::Error;
                    instance.last_health_check = Some(now);
                    true
                });
                if flagged == Some(true) {
                    error!(%plugin_id, "running plugin has no process handle");
                    last_failure = Some(Error::HealthProbeFailed {
                        plugin_id: plugin_id.to_string(),
                        reason: "no process handle".to_string(),
                    });
                }
                continue;
            };

            let alive = handle.check_alive();
            let applied = self.registry.with_instance(&plugin_id, |instance| {
                if instance.stopping || !instance.holds(&handle) {
                    return false;
                }
                instance.last_health_check = Some(now);
                if alive.is_err() {
                    instance.status = PluginStatus::Error;
                    instance.process = None;
                }
                true
            });
            if applied != Some(true) {
                debug!(%plugin_id, "instance changed during health check; result discarded");
                continue;
            }

            if let Err(failure) = alive {
                handle.close_log();
                error!(%plugin_id, pid = handle.pid(), error = %failure, "plugin health check failed");
                last_failure = Some(Error::HealthProbeFailed {
                    plugin_id: plugin_id.to_string(),
                    reason: failure.to_string(),
                });
            }
        }

        last_failure.map_or(Ok(()), Err)
    }
}

/// Background thread running [`PluginRuntime::health_check`] on an interval.
/// Stops when shut down or dropped.
#[derive(Debug)]
pub struct HealthMonitor {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn spawn(runtime: Arc<PluginRuntime>, interval: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("psv-health".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs_f64(), "health monitor started");
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = runtime.health_check() {
                                debug!(error = %e, "health sweep reported failures");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("health monitor stopped");
            })?;
        Ok(Self {
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            // A send error only means the thread is already gone.
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("health monitor thread panicked");
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
