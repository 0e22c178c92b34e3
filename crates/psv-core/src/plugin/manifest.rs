//! Plugin manifest (`manifest.json`) parsing and structural validation.
//!
//! # Example
//!
//! ```json
//! {
//!   "id": "slack-notify",
//!   "name": "Slack Notify",
//!   "version": "1.2.0",
//!   "entry": "bin/notify.sh",
//!   "args": ["--channel", "ops"],
//!   "permissions": ["network.outbound"],
//!   "dependencies": [],
//!   "checksum": "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
//!   "signature": "MEUCIQ...",
//!   "compatibility": {"api": "^1.0", "backend": ">=2.3"},
//!   "metadata": {"homepage": "https://example.invalid"}
//! }
//! ```

use psv_common::{is_compatible, PluginId, PLUGIN_API_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Manifest file name at the root of every plugin directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const SIGNED_PAYLOAD_TAG: &str = "psv-manifest/1";

/// Errors from manifest loading.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest is not valid JSON: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid field {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ManifestError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ManifestError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// API/backend version constraints declared by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// A plugin's self-declared metadata. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Executable path relative to the plugin directory.
    #[serde(alias = "entryPath")]
    pub entry: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// `sha256:<hex>` package checksum; see [`crate::verify`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Base64 DER ECDSA P-256 signature over [`PluginManifest::signed_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub compatibility: Compatibility,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PluginManifest {
    /// Bytes covered by the manifest signature: a JSON array of every field
    /// that decides identity, what runs and with which capabilities, plus the
    /// package checksum. `description` and `metadata` are not covered.
    pub fn signed_payload(&self) -> Option<String> {
        let checksum = self.checksum.as_ref()?;
        let payload = serde_json::json!([
            SIGNED_PAYLOAD_TAG,
            self.id,
            self.name,
            self.version,
            self.entry,
            self.args,
            self.permissions,
            self.dependencies,
            self.compatibility.api,
            self.compatibility.backend,
            checksum,
        ]);
        Some(payload.to_string())
    }

    /// Structural validation that does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let id = PluginId::parse(&self.id)
            .map_err(|e| ManifestError::invalid("id", e.reason.to_string()))?;

        if self.name.trim().is_empty() {
            return Err(ManifestError::invalid("name", "must not be empty"));
        }
        if !is_semver(&self.version) {
            return Err(ManifestError::invalid(
                "version",
                format!("{:?} is not MAJOR.MINOR.PATCH", self.version),
            ));
        }

        validate_entry(&self.entry)?;

        for permission in &self.permissions {
            if !is_capability(permission) {
                return Err(ManifestError::invalid(
                    "permissions",
                    format!("{permission:?} is not a capability string"),
                ));
            }
        }

        for dependency in &self.dependencies {
            let dep = PluginId::parse(dependency).map_err(|e| {
                ManifestError::invalid("dependencies", format!("{dependency:?}: {}", e.reason))
            })?;
            if dep == id {
                return Err(ManifestError::invalid(
                    "dependencies",
                    "plugin must not depend on itself",
                ));
            }
        }

        if let Some(checksum) = &self.checksum {
            if parse_checksum(checksum).is_none() {
                return Err(ManifestError::invalid(
                    "checksum",
                    "expected sha256:<64 lowercase hex>",
                ));
            }
        }

        if let Some(api) = &self.compatibility.api {
            if !is_compatible(api) {
                return Err(ManifestError::invalid(
                    "compatibility.api",
                    format!("{api:?} is incompatible with host API {PLUGIN_API_VERSION}"),
                ));
            }
        }

        Ok(())
    }
}

/// A validated manifest resolved against its plugin directory.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub manifest: PluginManifest,
    pub plugin_dir: PathBuf,
    /// Absolute path to the entry executable.
    pub entry_path: PathBuf,
}

/// Load `<plugin_dir>/manifest.json`, validate it, and resolve the entry.
pub fn load_manifest(plugin_dir: &Path) -> Result<ResolvedPlugin, ManifestError> {
    let path = plugin_dir.join(MANIFEST_FILE_NAME);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::NotFound { path })
        }
        Err(source) => return Err(ManifestError::Io { path, source }),
    };

    let manifest: PluginManifest =
        serde_json::from_slice(&content).map_err(|source| ManifestError::Parse { source })?;
    manifest.validate()?;

    let entry_path = plugin_dir.join(&manifest.entry);
    if !entry_path.is_file() {
        return Err(ManifestError::invalid(
            "entry",
            format!("{} does not exist or is not a file", manifest.entry),
        ));
    }

    Ok(ResolvedPlugin {
        manifest,
        plugin_dir: plugin_dir.to_path_buf(),
        entry_path,
    })
}

/// Split `sha256:<hex>` into its hex digest.
pub fn parse_checksum(checksum: &str) -> Option<&str> {
    let hex = checksum.strip_prefix("sha256:")?;
    let valid = hex.len() == 64
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some(hex)
}

fn validate_entry(entry: &str) -> Result<(), ManifestError> {
    if entry.is_empty() {
        return Err(ManifestError::invalid("entry", "must not be empty"));
    }
    let path = Path::new(entry);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ManifestError::invalid("entry", "must not contain '..'"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ManifestError::invalid(
                    "entry",
                    "must be relative to the plugin directory",
                ))
            }
        }
    }
    Ok(())
}

fn is_capability(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.:-".contains(c))
}

/// `MAJOR.MINOR.PATCH` with an optional `-pre` / `+build` suffix of
/// `[0-9A-Za-z.+-]`.
pub(crate) fn is_semver(version: &str) -> bool {
    let (core, suffix) = match version.split_once(['-', '+']) {
        Some((core, suffix)) => (core, Some(suffix)),
        None => (version, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    let core_ok = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    let suffix_ok = suffix.map_or(true, |s| {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b"+.-".contains(&b))
    });
    core_ok && suffix_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> PluginManifest {
        serde_json::from_str(
            r#"{
                "id": "echo",
                "name": "Echo",
                "version": "0.1.0",
                "entry": "run.sh",
                "permissions": ["log.write"]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_manifest_valid() {
        let m = manifest();
        assert!(m.validate().is_ok());
        assert!(m.args.is_empty());
        assert!(m.checksum.is_none());
        assert_eq!(m.compatibility, Compatibility::default());
    }

    #[test]
    fn test_entry_path_alias() {
        let m: PluginManifest = serde_json::from_str(
            r#"{"id":"a","name":"A","version":"1.0.0","entryPath":"bin/a"}"#,
        )
        .unwrap();
        assert_eq!(m.entry, "bin/a");
    }

    #[test]
    fn test_entry_traversal_rejected() {
        let mut m = manifest();
        m.entry = "../../bin/sh".to_string();
        assert!(matches!(
            m.validate(),
            Err(ManifestError::Invalid { field: "entry", .. })
        ));

        m.entry = "/bin/sh".to_string();
        assert!(matches!(
            m.validate(),
            Err(ManifestError::Invalid { field: "entry", .. })
        ));

        m.entry = "./bin/run".to_string();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_version_format() {
        for ok in ["1.0.0", "10.20.30", "1.0.0-beta.1", "1.0.0+build.5"] {
            assert!(is_semver(ok), "{ok}");
        }
        for bad in [
            "1.0",
            "v1.0.0",
            "1.0.x",
            "",
            "1..0",
            "1.0.0-",
            "1.0.0/../../escaped",
            "1.0.0-a/../../b",
            "1.0.0+x\\y",
        ] {
            assert!(!is_semver(bad), "{bad}");
        }
    }

    #[test]
    fn test_bad_permission_rejected() {
        let mut m = manifest();
        m.permissions.insert("Network Access".to_string());
        assert!(matches!(
            m.validate(),
            Err(ManifestError::Invalid {
                field: "permissions",
                ..
            })
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut m = manifest();
        m.dependencies.push("echo".to_string());
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_checksum_format() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_checksum(&format!("sha256:{digest}")),
            Some(digest.as_str())
        );
        assert!(parse_checksum("md5:abc").is_none());
        assert!(parse_checksum(&format!("sha256:{}", "A".repeat(64))).is_none());
        assert!(parse_checksum("sha256:abc").is_none());

        let mut m = manifest();
        m.checksum = Some("sha256:nothex".to_string());
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_incompatible_api_rejected() {
        let mut m = manifest();
        m.compatibility.api = Some("2.0.0".to_string());
        assert!(matches!(
            m.validate(),
            Err(ManifestError::Invalid {
                field: "compatibility.api",
                ..
            })
        ));
    }

    #[test]
    fn test_signed_payload_covers_launch_fields() {
        let mut m = manifest();
        assert!(m.signed_payload().is_none());
        m.checksum = Some(format!("sha256:{}", "0".repeat(64)));
        let base = m.signed_payload().unwrap();
        assert!(base.starts_with(r#"["psv-manifest/1","echo","Echo","0.1.0","run.sh""#));

        let mut tampered = m.clone();
        tampered.args.push("--evil".to_string());
        assert_ne!(tampered.signed_payload().unwrap(), base);

        let mut tampered = m.clone();
        tampered.permissions.insert("fs.write".to_string());
        assert_ne!(tampered.signed_payload().unwrap(), base);

        let mut tampered = m.clone();
        tampered.entry = "other.sh".to_string();
        assert_ne!(tampered.signed_payload().unwrap(), base);

        let mut cosmetic = m.clone();
        cosmetic.description = "changed".to_string();
        assert_eq!(cosmetic.signed_payload().unwrap(), base);
    }

    #[test]
    fn test_load_manifest_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("run.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            serde_json::to_string(&manifest()).unwrap(),
        )
        .unwrap();

        let resolved = load_manifest(dir.path()).unwrap();
        assert_eq!(resolved.manifest.id, "echo");
        assert_eq!(resolved.entry_path, dir.path().join("run.sh"));
    }

    #[test]
    fn test_load_manifest_missing_entry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            serde_json::to_string(&manifest()).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ManifestError::Invalid { field: "entry", .. })
        ));
    }

    #[test]
    fn test_load_manifest_not_found_and_garbage() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ManifestError::NotFound { .. })
        ));

        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), "not json {{").unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ManifestError::Parse { .. })
        ));
    }
}
