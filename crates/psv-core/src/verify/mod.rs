//! Install-time trust policy.
//!
//! [`TrustPolicyVerifier`] checks the package checksum recorded in the
//! manifest and, when present or required, the publisher signature over the
//! manifest's signed payload.
//!
//! The package checksum covers every file in the plugin directory except
//! `manifest.json`. Each file contributes a `<relative path>\0<sha256 hex>\n`
//! line; lines are sorted by path and the whole listing is hashed again.
//! The manifest itself is covered by the signature, not the checksum. [`VerificationDisabled`] admits everything and
//! says so in the log each time.

pub mod signature;

use psv_config::{VerificationConfig, VerificationMode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::plugin::manifest::{parse_checksum, ResolvedPlugin, MANIFEST_FILE_NAME};
use signature::{KeyRing, SignatureError};

/// Why a plugin was refused.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("manifest has no checksum and policy requires one")]
    ChecksumMissing,

    #[error("malformed checksum {0:?}")]
    MalformedChecksum(String),

    #[error("checksum mismatch: manifest says {expected}, package hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("manifest has no signature and policy requires one")]
    SignatureMissing,

    #[error("signature present but manifest has no checksum to bind it to")]
    SignatureWithoutChecksum,

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk plugin directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("unsupported file type in package: {path}")]
    UnsupportedEntry { path: PathBuf },
}

/// What a verifier established about an admitted plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Checksum that matched the package contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Fingerprint of the key that validated the signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    /// True when no policy was applied at all.
    pub unverified: bool,
}

/// Decides whether an extracted plugin may be installed.
pub trait Verifier: Send + Sync {
    fn verify(&self, plugin: &ResolvedPlugin) -> Result<VerificationReport, VerifyError>;
}

/// `sha256:<hex>` of `bytes`.
pub fn checksum_for(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Package checksum over in-memory `(relative path, contents)` pairs.
/// Paths use `/` separators; order does not matter.
pub fn checksum_files<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut lines: Vec<String> = files
        .into_iter()
        .map(|(path, bytes)| format!("{path}\0{}\n", hex::encode(Sha256::digest(bytes))))
        .collect();
    lines.sort();
    checksum_for(lines.concat().as_bytes())
}

/// Package checksum of an extracted plugin directory. Only regular files
/// and directories are accepted; `manifest.json` at the root is skipped.
pub fn package_checksum(plugin_dir: &Path) -> Result<String, VerifyError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(plugin_dir).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            return Err(VerifyError::UnsupportedEntry {
                path: entry.path().to_path_buf(),
            });
        }
        let relative = entry
            .path()
            .strip_prefix(plugin_dir)
            .map_err(|_| VerifyError::UnsupportedEntry {
                path: entry.path().to_path_buf(),
            })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name == MANIFEST_FILE_NAME {
            continue;
        }
        let bytes = std::fs::read(entry.path()).map_err(|source| VerifyError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        files.push((name, bytes));
    }
    Ok(checksum_files(
        files.iter().map(|(name, bytes)| (name.as_str(), bytes.as_slice())),
    ))
}

/// Checksum + signature policy.
#[derive(Debug, Clone)]
pub struct TrustPolicyVerifier {
    require_checksum: bool,
    require_signature: bool,
    keys: KeyRing,
}

impl TrustPolicyVerifier {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            require_checksum: true,
            require_signature: false,
            keys,
        }
    }

    /// Fails if any configured trusted key is malformed.
    pub fn from_config(config: &VerificationConfig) -> Result<Self, SignatureError> {
        Ok(Self {
            require_checksum: config.require_checksum,
            require_signature: config.require_signature,
            keys: KeyRing::from_base64_keys(config.trusted_keys.as_slice())?,
        })
    }

    pub fn require_checksum(mut self, require: bool) -> Self {
        self.require_checksum = require;
        self
    }

    pub fn require_signature(mut self, require: bool) -> Self {
        self.require_signature = require;
        self
    }
}

impl Verifier for TrustPolicyVerifier {
    fn verify(&self, plugin: &ResolvedPlugin) -> Result<VerificationReport, VerifyError> {
        let manifest = &plugin.manifest;
        let mut report = VerificationReport::default();

        match manifest.checksum.as_deref() {
            Some(expected) => {
                if parse_checksum(expected).is_none() {
                    return Err(VerifyError::MalformedChecksum(expected.to_string()));
                }
                let actual = package_checksum(&plugin.plugin_dir)?;
                if actual != expected {
                    return Err(VerifyError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
                report.checksum = Some(actual);
            }
            None if self.require_checksum => return Err(VerifyError::ChecksumMissing),
            None => {}
        }

        match manifest.signature.as_deref() {
            // Present signatures are always checked, required or not.
            Some(sig) => {
                let payload = manifest
                    .signed_payload()
                    .ok_or(VerifyError::SignatureWithoutChecksum)?;
                let fingerprint = self.keys.verify(payload.as_bytes(), sig)?;
                report.signer = Some(fingerprint);
            }
            None if self.require_signature => return Err(VerifyError::SignatureMissing),
            None => {}
        }

        debug!(
            plugin_id = %manifest.id,
            checksum = report.checksum.is_some(),
            signer = ?report.signer,
            "plugin verified"
        );
        Ok(report)
    }
}

/// Admits every plugin. Only for development setups.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerificationDisabled;

impl Verifier for VerificationDisabled {
    fn verify(&self, plugin: &ResolvedPlugin) -> Result<VerificationReport, VerifyError> {
        warn!(
            plugin_id = %plugin.manifest.id,
            "verification disabled; admitting plugin without checks"
        );
        Ok(VerificationReport {
            unverified: true,
            ..VerificationReport::default()
        })
    }
}

/// The verifier selected by `verification.mode`.
pub fn verifier_from_config(
    config: &VerificationConfig,
) -> Result<Box<dyn Verifier>, SignatureError> {
    Ok(match config.mode {
        VerificationMode::Enforce => Box::new(TrustPolicyVerifier::from_config(config)?),
        VerificationMode::Disabled => Box::new(VerificationDisabled),
    })
}

#[cfg(test)]
mod tests {
    use super::signature::{generate_keypair, parse_secret_key, sign_payload};
    use super::*;
    use crate::plugin::manifest::PluginManifest;
    use tempfile::TempDir;

    const ENTRY: &[u8] = b"#!/bin/sh\nexec sleep 60\n";

    fn entry_checksum() -> String {
        checksum_files([("run.sh", ENTRY)])
    }

    fn signed(resolved: &mut ResolvedPlugin, secret: &str) {
        let key = parse_secret_key(secret).unwrap();
        let payload = resolved.manifest.signed_payload().unwrap();
        resolved.manifest.signature = Some(sign_payload(payload.as_bytes(), &key));
    }

    fn plugin(dir: &TempDir, checksum: Option<String>, signature: Option<String>) -> ResolvedPlugin {
        let entry_path = dir.path().join("run.sh");
        std::fs::write(&entry_path, ENTRY).unwrap();
        let mut manifest: PluginManifest = serde_json::from_value(serde_json::json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "entry": "run.sh"
        }))
        .unwrap();
        manifest.checksum = checksum;
        manifest.signature = signature;
        ResolvedPlugin {
            manifest,
            plugin_dir: dir.path().to_path_buf(),
            entry_path,
        }
    }

    #[test]
    fn test_checksum_matches() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, Some(entry_checksum()), None);

        let report = TrustPolicyVerifier::new(KeyRing::new())
            .verify(&resolved)
            .unwrap();
        assert_eq!(report.checksum, Some(entry_checksum()));
        assert!(!report.unverified);
    }

    #[test]
    fn test_checksum_covers_every_packaged_file() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, Some(entry_checksum()), None);
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();
        let verifier = TrustPolicyVerifier::new(KeyRing::new());
        assert!(verifier.verify(&resolved).is_ok(), "manifest is not hashed");

        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/payload.sh"), "echo extra\n").unwrap();
        assert!(matches!(
            verifier.verify(&resolved),
            Err(VerifyError::ChecksumMismatch { .. })
        ));

        let both = checksum_files([
            ("lib/payload.sh", b"echo extra\n".as_slice()),
            ("run.sh", ENTRY),
        ]);
        assert_eq!(package_checksum(dir.path()).unwrap(), both);
    }

    #[test]
    fn test_checksum_files_order_independent() {
        let a = checksum_files([("a", b"1".as_slice()), ("b/c", b"2".as_slice())]);
        let b = checksum_files([("b/c", b"2".as_slice()), ("a", b"1".as_slice())]);
        assert_eq!(a, b);
        assert_ne!(a, checksum_files([("a", b"1".as_slice()), ("b/d", b"2".as_slice())]));
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, Some(checksum_for(b"something else")), None);

        let result = TrustPolicyVerifier::new(KeyRing::new()).verify(&resolved);
        assert!(matches!(result, Err(VerifyError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_checksum_required() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, None, None);

        let strict = TrustPolicyVerifier::new(KeyRing::new());
        assert!(matches!(
            strict.verify(&resolved),
            Err(VerifyError::ChecksumMissing)
        ));

        let lax = TrustPolicyVerifier::new(KeyRing::new()).require_checksum(false);
        assert!(lax.verify(&resolved).is_ok());
    }

    #[test]
    fn test_valid_signature() {
        let dir = TempDir::new().unwrap();
        let (secret, public) = generate_keypair();
        let mut resolved = plugin(&dir, Some(entry_checksum()), None);
        signed(&mut resolved, &secret);

        let verifier = TrustPolicyVerifier::new(KeyRing::from_base64_keys(&[public]).unwrap())
            .require_signature(true);
        let report = verifier.verify(&resolved).unwrap();
        assert!(report.signer.is_some());
    }

    #[test]
    fn test_signature_rejects_changed_args() {
        let dir = TempDir::new().unwrap();
        let (secret, public) = generate_keypair();
        let mut resolved = plugin(&dir, Some(entry_checksum()), None);
        signed(&mut resolved, &secret);
        let verifier = TrustPolicyVerifier::new(KeyRing::from_base64_keys(&[public]).unwrap());

        let mut tampered = resolved.clone();
        tampered.manifest.args = vec!["--attacker-chosen".to_string()];
        assert!(matches!(
            verifier.verify(&tampered),
            Err(VerifyError::Signature(SignatureError::Untrusted { .. }))
        ));

        let mut tampered = resolved;
        tampered.manifest.permissions.insert("fs.write".to_string());
        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn test_signature_from_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let (secret, _) = generate_keypair();
        let (_, trusted) = generate_keypair();
        let mut resolved = plugin(&dir, Some(entry_checksum()), None);
        signed(&mut resolved, &secret);

        let verifier = TrustPolicyVerifier::new(KeyRing::from_base64_keys(&[trusted]).unwrap());
        assert!(matches!(
            verifier.verify(&resolved),
            Err(VerifyError::Signature(SignatureError::Untrusted { .. }))
        ));
    }

    #[test]
    fn test_signature_required_but_missing() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, Some(entry_checksum()), None);
        let verifier = TrustPolicyVerifier::new(KeyRing::new()).require_signature(true);
        assert!(matches!(
            verifier.verify(&resolved),
            Err(VerifyError::SignatureMissing)
        ));
    }

    #[test]
    fn test_disabled_admits_anything() {
        let dir = TempDir::new().unwrap();
        let resolved = plugin(&dir, Some(checksum_for(b"wrong")), None);
        let report = VerificationDisabled.verify(&resolved).unwrap();
        assert!(report.unverified);
    }

    #[test]
    fn test_from_config_rejects_bad_key() {
        let config = VerificationConfig {
            trusted_keys: vec!["not-a-key".to_string()],
            ..VerificationConfig::default()
        };
        assert!(verifier_from_config(&config).is_err());

        let disabled = VerificationConfig {
            mode: VerificationMode::Disabled,
            ..config
        };
        assert!(verifier_from_config(&disabled).is_ok());
    }
}
