//! `psv` command-line interface.

use clap::{Args, Parser, Subcommand};
use psv_common::Error;
use psv_config::{resolve_config, ConfigSource, SupervisorConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::exit_codes::ExitCode;
use crate::logging::{self, LogFormat};
use crate::plugin::{load_manifest, PluginDescriptor};
use crate::runtime::{HealthMonitor, PluginRuntime};
use crate::verify::signature::{
    generate_keypair, key_fingerprint, parse_public_key, parse_secret_key, sign_payload,
};
use crate::verify::{package_checksum, verifier_from_config};

#[derive(Parser, Debug)]
#[command(name = "psv", version, about = "Install, run and supervise plugin processes")]
pub struct Cli {
    /// Config file (TOML, or JSON by extension)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install and start plugins, supervise them until interrupted, then
    /// stop and uninstall them
    Run(RunArgs),
    /// Load and validate a plugin manifest
    Manifest {
        /// Plugin directory containing manifest.json
        dir: PathBuf,
    },
    /// Check an unpacked plugin against the configured trust policy
    Verify {
        /// Plugin directory containing manifest.json
        dir: PathBuf,
    },
    /// Generate a P-256 signing key pair
    Keygen,
    /// Compute the checksum and signature to embed in a manifest
    Sign {
        /// Plugin directory containing manifest.json
        dir: PathBuf,
        /// Base64 secret key from `psv keygen`
        #[arg(long, env = "PSV_SECRET_KEY", hide_env_values = true)]
        secret_key: String,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of plugin descriptors
    #[arg(long, value_name = "FILE")]
    pub descriptors: PathBuf,

    /// Tear down and exit after this many seconds instead of waiting for a
    /// signal
    #[arg(long, value_name = "SECS")]
    pub exit_after: Option<u64>,
}

/// Parse arguments, set up logging, and run the command.
pub fn run(cli: Cli) -> ExitCode {
    if let Err(e) = logging::init(cli.log_format, cli.verbose) {
        eprintln!("psv: failed to initialise logging: {e}");
    }

    let result = match &cli.command {
        Command::Run(args) => {
            load_config(cli.config.as_deref()).and_then(|(_, config)| run_plugins(config, args))
        }
        Command::Manifest { dir } => show_manifest(dir),
        Command::Verify { dir } => {
            load_config(cli.config.as_deref()).and_then(|(_, config)| verify_dir(&config, dir))
        }
        Command::Keygen => keygen(),
        Command::Sign { dir, secret_key } => sign_dir(dir, secret_key),
        Command::Config => load_config(cli.config.as_deref()).and_then(|(source, config)| {
            print_json(&serde_json::json!({
                "source": describe_source(&source),
                "config": config,
            }))
        }),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, code = e.code(), "command failed");
            eprintln!("psv: {e}");
            ExitCode::from(&e)
        }
    }
}

fn load_config(cli: Option<&Path>) -> Result<(ConfigSource, SupervisorConfig), Error> {
    let resolved = resolve_config(cli).map_err(|e| Error::Config(e.to_string()))?;
    Ok((resolved.source, resolved.config))
}

fn describe_source(source: &ConfigSource) -> String {
    match source {
        ConfigSource::Cli(path) => format!("cli:{}", path.display()),
        ConfigSource::Env(path) => format!("env:{}", path.display()),
        ConfigSource::Xdg(path) => format!("xdg:{}", path.display()),
        ConfigSource::Defaults => "defaults".to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<ExitCode, Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::Ok)
}

fn manifest_error(dir: &Path, e: impl std::fmt::Display) -> Error {
    Error::ManifestInvalid {
        plugin_id: dir.display().to_string(),
        reason: e.to_string(),
    }
}

fn show_manifest(dir: &Path) -> Result<ExitCode, Error> {
    let resolved = load_manifest(dir).map_err(|e| manifest_error(dir, e))?;
    print_json(&resolved.manifest)
}

fn verify_dir(config: &SupervisorConfig, dir: &Path) -> Result<ExitCode, Error> {
    let resolved = load_manifest(dir).map_err(|e| manifest_error(dir, e))?;
    let verifier = verifier_from_config(&config.verification)
        .map_err(|e| Error::Config(format!("verification.trusted_keys: {e}")))?;
    let report = verifier
        .verify(&resolved)
        .map_err(|e| Error::VerificationFailed {
            plugin_id: resolved.manifest.id.clone(),
            reason: e.to_string(),
        })?;
    print_json(&serde_json::json!({
        "plugin_id": resolved.manifest.id,
        "version": resolved.manifest.version,
        "report": report,
    }))
}

fn keygen() -> Result<ExitCode, Error> {
    let (secret_key, public_key) = generate_keypair();
    let fingerprint = parse_public_key(&public_key)
        .map(|key| key_fingerprint(&key))
        .map_err(|e| Error::Config(e.to_string()))?;
    print_json(&serde_json::json!({
        "secret_key": secret_key,
        "public_key": public_key,
        "fingerprint": fingerprint,
    }))
}

fn sign_dir(dir: &Path, secret_key: &str) -> Result<ExitCode, Error> {
    let key = parse_secret_key(secret_key).map_err(|e| Error::Config(e.to_string()))?;
    let mut resolved = load_manifest(dir).map_err(|e| manifest_error(dir, e))?;
    let checksum = package_checksum(dir).map_err(|e| manifest_error(dir, e))?;

    resolved.manifest.checksum = Some(checksum.clone());
    let payload = resolved
        .manifest
        .signed_payload()
        .ok_or_else(|| manifest_error(dir, "checksum missing after signing"))?;
    let signature = sign_payload(payload.as_bytes(), &key);
    print_json(&serde_json::json!({
        "checksum": checksum,
        "signature": signature,
    }))
}

fn read_descriptors(path: &Path) -> Result<Vec<PluginDescriptor>, Error> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("descriptors {}: {e}", path.display())))
}

fn run_plugins(config: SupervisorConfig, args: &RunArgs) -> Result<ExitCode, Error> {
    let descriptors = read_descriptors(&args.descriptors)?;
    let health_interval = config.health.interval();
    let runtime = Arc::new(PluginRuntime::from_config(config)?);

    let mut first_failure: Option<ExitCode> = None;
    for descriptor in &descriptors {
        let outcome = runtime
            .install(descriptor)
            .and_then(|()| runtime.start(&descriptor.id));
        if let Err(e) = outcome {
            error!(plugin_id = %descriptor.id, error = %e, "failed to bring up plugin");
            first_failure.get_or_insert(ExitCode::from(&e));
        }
    }
    info!(
        requested = descriptors.len(),
        installed = runtime.list().len(),
        "plugins started; supervising"
    );

    let monitor = HealthMonitor::spawn(Arc::clone(&runtime), health_interval)?;
    install_shutdown_handler();
    let deadline = args
        .exit_after
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    while !SHUTDOWN.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(100));
    }
    monitor.shutdown();

    info!("shutting down; removing plugins");
    if let Err(e) = runtime.shutdown() {
        first_failure.get_or_insert(ExitCode::from(&e));
    }
    for id in runtime.plugin_ids() {
        if let Err(e) = runtime.uninstall(id.as_str()) {
            warn!(plugin_id = %id, error = %e, "failed to uninstall plugin");
            first_failure.get_or_insert(ExitCode::from(&e));
        }
    }

    Ok(first_failure.unwrap_or(ExitCode::Ok))
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_shutdown_handler() {
    let handler = on_shutdown_signal as extern "C" fn(libc::c_int);
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        if unsafe { libc::signal(signal, handler as libc::sighandler_t) } == libc::SIG_ERR {
            warn!(signal, "failed to install shutdown handler");
        }
    }
}

#[cfg(not(unix))]
fn install_shutdown_handler() {}
