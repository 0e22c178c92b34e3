//! Error types for the plugin supervisor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for plugin supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for plugin lifecycle operations.
///
/// Every variant that concerns a specific plugin carries its ID so callers
/// can render a message without tracking context themselves.
#[derive(Error, Debug)]
pub enum Error {
    // Registry errors (10-19)
    #[error("plugin {plugin_id} is already installed")]
    AlreadyInstalled { plugin_id: String },

    #[error("plugin {plugin_id} not found")]
    NotFound { plugin_id: String },

    #[error("invalid plugin id: {0}")]
    InvalidPluginId(String),

    // Install pipeline errors (20-29)
    #[error("failed to fetch plugin {plugin_id}: {reason}")]
    FetchFailed { plugin_id: String, reason: String },

    #[error("failed to extract plugin {plugin_id}: {reason}")]
    ExtractFailed { plugin_id: String, reason: String },

    #[error("invalid manifest for plugin {plugin_id}: {reason}")]
    ManifestInvalid { plugin_id: String, reason: String },

    #[error("verification failed for plugin {plugin_id}: {reason}")]
    VerificationFailed { plugin_id: String, reason: String },

    // Process errors (30-39)
    #[error("failed to create log file for plugin {plugin_id}: {reason}")]
    LogCreationFailed { plugin_id: String, reason: String },

    #[error("failed to spawn plugin {plugin_id}: {reason}")]
    SpawnFailed { plugin_id: String, reason: String },

    #[error("plugin {plugin_id} is already running")]
    AlreadyRunning { plugin_id: String },

    #[error("plugin {plugin_id} is not running")]
    NotRunning { plugin_id: String },

    // Teardown and health errors (40-49)
    #[error("failed to remove directory of plugin {plugin_id}: {reason}")]
    DirectoryRemovalFailed { plugin_id: String, reason: String },

    #[error("health check failed for plugin {plugin_id}: {reason}")]
    HealthProbeFailed { plugin_id: String, reason: String },

    // Ambient errors (60-69)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Discriminant of [`Error`], cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyInstalled,
    NotFound,
    InvalidPluginId,
    FetchFailed,
    ExtractFailed,
    ManifestInvalid,
    VerificationFailed,
    LogCreationFailed,
    SpawnFailed,
    AlreadyRunning,
    NotRunning,
    DirectoryRemovalFailed,
    HealthProbeFailed,
    Config,
    Io,
    Json,
}

impl Error {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyInstalled { .. } => ErrorKind::AlreadyInstalled,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidPluginId(_) => ErrorKind::InvalidPluginId,
            Error::FetchFailed { .. } => ErrorKind::FetchFailed,
            Error::ExtractFailed { .. } => ErrorKind::ExtractFailed,
            Error::ManifestInvalid { .. } => ErrorKind::ManifestInvalid,
            Error::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Error::LogCreationFailed { .. } => ErrorKind::LogCreationFailed,
            Error::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Error::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Error::NotRunning { .. } => ErrorKind::NotRunning,
            Error::DirectoryRemovalFailed { .. } => ErrorKind::DirectoryRemovalFailed,
            Error::HealthProbeFailed { .. } => ErrorKind::HealthProbeFailed,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
        }
    }

    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output and audit records.
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// The plugin this error concerns, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Error::AlreadyInstalled { plugin_id }
            | Error::NotFound { plugin_id }
            | Error::AlreadyRunning { plugin_id }
            | Error::NotRunning { plugin_id } => Some(plugin_id),
            Error::FetchFailed { plugin_id, .. }
            | Error::ExtractFailed { plugin_id, .. }
            | Error::ManifestInvalid { plugin_id, .. }
            | Error::VerificationFailed { plugin_id, .. }
            | Error::LogCreationFailed { plugin_id, .. }
            | Error::SpawnFailed { plugin_id, .. }
            | Error::DirectoryRemovalFailed { plugin_id, .. }
            | Error::HealthProbeFailed { plugin_id, .. } => Some(plugin_id),
            Error::InvalidPluginId(_) | Error::Config(_) | Error::Io(_) | Error::Json(_) => None,
        }
    }

    /// Whether retrying the same operation later may succeed without
    /// operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::HealthProbeFailed | ErrorKind::FetchFailed
        )
    }

    /// Whether the failure points at the plugin package itself and needs a
    /// human before the plugin can be installed.
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::VerificationFailed | ErrorKind::ManifestInvalid
        )
    }
}

impl ErrorKind {
    /// Stable numeric code, grouped by lifecycle phase.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::AlreadyInstalled => 10,
            ErrorKind::NotFound => 11,
            ErrorKind::InvalidPluginId => 12,
            ErrorKind::FetchFailed => 20,
            ErrorKind::ExtractFailed => 21,
            ErrorKind::ManifestInvalid => 22,
            ErrorKind::VerificationFailed => 23,
            ErrorKind::LogCreationFailed => 30,
            ErrorKind::SpawnFailed => 31,
            ErrorKind::AlreadyRunning => 32,
            ErrorKind::NotRunning => 33,
            ErrorKind::DirectoryRemovalFailed => 40,
            ErrorKind::HealthProbeFailed => 41,
            ErrorKind::Config => 60,
            ErrorKind::Io => 61,
            ErrorKind::Json => 62,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let kinds = [
            ErrorKind::AlreadyInstalled,
            ErrorKind::NotFound,
            ErrorKind::InvalidPluginId,
            ErrorKind::FetchFailed,
            ErrorKind::ExtractFailed,
            ErrorKind::ManifestInvalid,
            ErrorKind::VerificationFailed,
            ErrorKind::LogCreationFailed,
            ErrorKind::SpawnFailed,
            ErrorKind::AlreadyRunning,
            ErrorKind::NotRunning,
            ErrorKind::DirectoryRemovalFailed,
            ErrorKind::HealthProbeFailed,
            ErrorKind::Config,
            ErrorKind::Io,
            ErrorKind::Json,
        ];
        let mut codes: Vec<u32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_retry_classification() {
        let fetch = Error::FetchFailed {
            plugin_id: "a".into(),
            reason: "timeout".into(),
        };
        let verify = Error::VerificationFailed {
            plugin_id: "a".into(),
            reason: "checksum".into(),
        };
        assert!(fetch.is_retryable());
        assert!(!fetch.requires_intervention());
        assert!(!verify.is_retryable());
        assert!(verify.requires_intervention());
    }

    #[test]
    fn test_plugin_id_accessor() {
        let err = Error::NotFound {
            plugin_id: "ghost".into(),
        };
        assert_eq!(err.plugin_id(), Some("ghost"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "plugin ghost not found");
        assert!(Error::Config("bad".into()).plugin_id().is_none());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DirectoryRemovalFailed).unwrap();
        assert_eq!(json, "\"directory_removal_failed\"");
    }
}
