//! OS process plumbing for plugin subprocesses.
//!
//! A [`ProcessHandle`] owns the child and its log file. It is shared through
//! an `Arc` so stop and health probing can work on it without the registry
//! lock. Every operation that signals the pid first checks, under the child
//! lock, that the child has not been reaped, so a recycled pid is never hit.

use psv_common::{Error, PluginId};
use psv_config::{StopConfig, StopSignal};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

/// Poll interval of the background reaper for abandoned processes.
const REAP_POLL: Duration = Duration::from_millis(200);

/// A running plugin subprocess.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<Child>,
    /// Kept open for the life of the process; `None` once closed.
    log: Mutex<Option<File>>,
    log_path: PathBuf,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

/// Why a liveness check failed.
#[derive(Debug, ThisError)]
pub enum LivenessFailure {
    #[error("process exited ({0})")]
    Exited(ExitStatus),
    #[error("process {0} no longer exists")]
    Vanished(u32),
    #[error("failed to poll process: {0}")]
    Wait(#[source] std::io::Error),
}

/// How a stop attempt ended.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StopOutcome {
    /// SIGKILL was needed.
    pub forced: bool,
    /// `None` when the process could not be reaped.
    pub exit: Option<ExitStatus>,
}

impl StopOutcome {
    pub(crate) fn details(&self) -> serde_json::Value {
        let mut details = serde_json::json!({ "forced": self.forced });
        if let Some(status) = self.exit {
            details["exit_status"] = serde_json::Value::String(status.to_string());
            if let Some(code) = status.code() {
                details["exit_code"] = code.into();
            }
        } else {
            details["abandoned"] = true.into();
        }
        details
    }
}

/// Everything needed to spawn one plugin process.
#[derive(Debug)]
pub(crate) struct LaunchRequest<'a> {
    pub plugin_id: &'a PluginId,
    pub plugin_dir: &'a Path,
    pub entry: &'a str,
    pub args: &'a [String],
    pub environment: &'a BTreeMap<String, String>,
    pub inherit_env: &'a [String],
    pub log_path: PathBuf,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the log, then spawn with stdout and stderr appended to it.
    pub(crate) fn spawn(request: LaunchRequest<'_>) -> Result<Self, Error> {
        let plugin_id = request.plugin_id.to_string();
        let log = open_log(&request.log_path).map_err(|e| Error::LogCreationFailed {
            plugin_id: plugin_id.clone(),
            reason: format!("{}: {e}", request.log_path.display()),
        })?;
        let dup_failed = |e: std::io::Error| Error::LogCreationFailed {
            plugin_id: plugin_id.clone(),
            reason: format!("failed to duplicate log handle: {e}"),
        };
        let stdout = log.try_clone().map_err(dup_failed)?;
        let stderr = log.try_clone().map_err(dup_failed)?;

        let entry_path = request.plugin_dir.join(request.entry);
        let mut command = Command::new(&entry_path);
        command
            .args(request.args)
            .current_dir(request.plugin_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for name in request.inherit_env {
            if let Some(value) = std::env::var_os(name) {
                command.env(name, value);
            }
        }
        command.envs(request.environment);

        // On failure `log` drops here and the file is closed.
        let child = command.spawn().map_err(|e| Error::SpawnFailed {
            plugin_id,
            reason: format!("{}: {e}", entry_path.display()),
        })?;

        let pid = child.id();
        debug!(plugin_id = %request.plugin_id, pid, entry = %entry_path.display(), "plugin process spawned");
        Ok(Self {
            pid,
            child: Mutex::new(child),
            log: Mutex::new(Some(log)),
            log_path: request.log_path,
        })
    }

    /// Non-blocking reap.
    pub(crate) fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        self.child().try_wait()
    }

    /// Check that the process is still alive. Reaps it if it has exited.
    pub(crate) fn check_alive(&self) -> Result<(), LivenessFailure> {
        let mut child = self.child();
        if let Some(status) = child.try_wait().map_err(LivenessFailure::Wait)? {
            return Err(LivenessFailure::Exited(status));
        }
        if signal_zero(self.pid) {
            Ok(())
        } else {
            Err(LivenessFailure::Vanished(self.pid))
        }
    }

    /// Send `signal` unless the child has already been reaped.
    fn send(&self, signal: StopSignal) -> std::io::Result<()> {
        let mut child = self.child();
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        send_stop_signal(&mut child, signal)
    }

    fn kill(&self) -> std::io::Result<()> {
        let mut child = self.child();
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child.kill()
    }

    /// Poll for exit until `timeout` elapses.
    fn wait_for_exit(&self, timeout: Duration, poll: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "failed to poll plugin process");
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Graceful signal, grace period, then SIGKILL with a bounded wait.
    pub(crate) fn terminate(&self, plugin_id: &PluginId, config: &StopConfig) -> StopOutcome {
        if let Err(e) = self.send(config.signal) {
            warn!(%plugin_id, pid = self.pid, signal = %config.signal, error = %e, "failed to send stop signal");
        }
        if let Some(status) = self.wait_for_exit(config.grace_period(), config.poll_interval()) {
            return StopOutcome {
                forced: false,
                exit: Some(status),
            };
        }

        warn!(
            %plugin_id,
            pid = self.pid,
            grace_ms = config.grace_period_ms,
            "grace period elapsed; sending SIGKILL"
        );
        if let Err(e) = self.kill() {
            warn!(%plugin_id, pid = self.pid, error = %e, "failed to send SIGKILL");
        }
        let exit = self.wait_for_exit(config.kill_timeout(), config.poll_interval());
        if exit.is_none() {
            error!(
                %plugin_id,
                pid = self.pid,
                timeout_ms = config.kill_timeout_ms,
                "plugin process survived SIGKILL; leaving it to a background reaper"
            );
        }
        StopOutcome { forced: true, exit }
    }

    /// Keep polling an abandoned child on a detached thread so it is reaped
    /// whenever it finally exits. The child lock is only held per poll.
    pub(crate) fn reap_in_background(self: Arc<Self>, plugin_id: &PluginId) {
        let plugin_id = plugin_id.clone();
        let pid = self.pid;
        let spawned = std::thread::Builder::new()
            .name(format!("psv-reap-{pid}"))
            .spawn(move || loop {
                match self.try_wait() {
                    Ok(Some(status)) => {
                        info!(%plugin_id, pid, %status, "abandoned plugin process reaped");
                        return;
                    }
                    Ok(None) => std::thread::sleep(REAP_POLL),
                    Err(e) => {
                        warn!(%plugin_id, pid, error = %e, "giving up on abandoned plugin process");
                        return;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(pid, error = %e, "failed to start reaper thread; process may linger as a zombie");
        }
    }

    /// Kill and reap a child that must not be kept.
    pub(crate) fn discard(&self) {
        let mut child = self.child();
        if let Err(e) = child.kill() {
            debug!(pid = self.pid, error = %e, "kill of discarded process failed");
        }
        if let Err(e) = child.wait() {
            warn!(pid = self.pid, error = %e, "failed to reap discarded process");
        }
        drop(child);
        self.close_log();
    }

    /// Drop the log file handle. Idempotent.
    pub(crate) fn close_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[cfg(test)]
    pub(crate) fn log_is_open(&self) -> bool {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
fn send_stop_signal(child: &mut Child, signal: StopSignal) -> std::io::Result<()> {
    let signo = match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Interrupt => libc::SIGINT,
    };
    let pid = libc::pid_t::try_from(child.id()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;
    // SAFETY: `pid` belongs to an unreaped child we own.
    if unsafe { libc::kill(pid, signo) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_stop_signal(child: &mut Child, _signal: StopSignal) -> std::io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn signal_zero(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn signal_zero(_pid: u32) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn launch(dir: &TempDir, entry: &str, env: &BTreeMap<String, String>) -> Result<ProcessHandle, Error> {
        let id = PluginId::parse("proc-test").unwrap();
        let inherit = vec!["PATH".to_string()];
        ProcessHandle::spawn(LaunchRequest {
            plugin_id: &id,
            plugin_dir: dir.path(),
            entry,
            args: &[],
            environment: env,
            inherit_env: &inherit,
            log_path: dir.path().join("logs/proc-test.log"),
        })
    }

    fn fast_stop() -> StopConfig {
        StopConfig {
            grace_period_ms: 300,
            kill_timeout_ms: 2_000,
            poll_interval_ms: 10,
            signal: StopSignal::Terminate,
        }
    }

    #[test]
    fn test_spawn_writes_log_and_env() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "run.sh", "echo \"greeting=$GREETING\"\necho oops >&2");
        let env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);

        let handle = launch(&dir, "run.sh", &env).unwrap();
        let status = handle.wait_for_exit(Duration::from_secs(5), Duration::from_millis(10));
        assert!(status.is_some_and(|s| s.success()));

        let log = std::fs::read_to_string(handle.log_path()).unwrap();
        assert!(log.contains("greeting=hi"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn test_spawn_missing_entry() {
        let dir = TempDir::new().unwrap();
        let err = launch(&dir, "missing.sh", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[test]
    fn test_graceful_terminate() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "run.sh", "exec sleep 60");
        let handle = launch(&dir, "run.sh", &BTreeMap::new()).unwrap();
        assert!(handle.check_alive().is_ok());

        let id = PluginId::parse("proc-test").unwrap();
        let outcome = handle.terminate(&id, &fast_stop());
        assert!(!outcome.forced);
        assert!(outcome.exit.is_some());
        assert!(matches!(handle.check_alive(), Err(LivenessFailure::Exited(_))));
    }

    #[test]
    fn test_forced_terminate() {
        let dir = TempDir::new().unwrap();
        script(
            dir.path(),
            "run.sh",
            "trap '' TERM INT\necho ready\nwhile true; do sleep 0.05; done",
        );
        let handle = launch(&dir, "run.sh", &BTreeMap::new()).unwrap();
        // Give the shell time to install its trap.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !std::fs::read_to_string(handle.log_path())
            .unwrap_or_default()
            .contains("ready")
        {
            assert!(Instant::now() < deadline, "plugin never became ready");
            std::thread::sleep(Duration::from_millis(10));
        }

        let id = PluginId::parse("proc-test").unwrap();
        let outcome = handle.terminate(&id, &fast_stop());
        assert!(outcome.forced);
        assert!(outcome.exit.is_some());
        assert_eq!(outcome.details()["forced"], true);
    }

    #[test]
    fn test_discard_closes_log() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "run.sh", "exec sleep 60");
        let handle = launch(&dir, "run.sh", &BTreeMap::new()).unwrap();
        assert!(handle.log_is_open());

        handle.discard();
        assert!(!handle.log_is_open());
        assert!(handle.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_background_reaper_collects_late_exit() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "run.sh", "sleep 0.3");
        let handle = Arc::new(launch(&dir, "run.sh", &BTreeMap::new()).unwrap());
        let pid = handle.pid();

        let id = PluginId::parse("proc-test").unwrap();
        Arc::clone(&handle).reap_in_background(&id);
        drop(handle);

        // An unreaped zombie still answers signal 0.
        let deadline = Instant::now() + Duration::from_secs(10);
        while signal_zero(pid) {
            assert!(Instant::now() < deadline, "process {pid} was never reaped");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
