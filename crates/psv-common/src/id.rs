//! Plugin identity type.
//!
//! A plugin ID names both the registry entry and the on-disk directory
//! `<plugins_root>/<id>/`, so it must be safe to use as a single path
//! component.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Maximum accepted plugin ID length.
pub const MAX_PLUGIN_ID_LEN: usize = 64;

/// Validated plugin identifier.
///
/// Format: lowercase ASCII letters, digits, `.`, `_` and `-`, starting with a
/// letter or digit, at most [`MAX_PLUGIN_ID_LEN`] characters.
/// Example: `slack-notify`, `metrics.exporter_v2`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginId(String);

/// Rejected plugin ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid plugin id {id:?}: {reason}")]
pub struct PluginIdError {
    pub id: String,
    pub reason: &'static str,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("static regex"))
}

impl PluginId {
    /// Parse and validate a plugin ID string.
    pub fn parse(s: &str) -> Result<Self, PluginIdError> {
        let reject = |reason| PluginIdError {
            id: s.to_string(),
            reason,
        };

        if s.is_empty() {
            return Err(reject("must not be empty"));
        }
        if s.len() > MAX_PLUGIN_ID_LEN {
            return Err(reject("longer than 64 characters"));
        }
        if !id_pattern().is_match(s) {
            return Err(reject(
                "must start with [a-z0-9] and contain only [a-z0-9._-]",
            ));
        }
        // `..` would still escape the plugins root even though every
        // character is allowed individually.
        if s.contains("..") {
            return Err(reject("must not contain '..'"));
        }

        Ok(PluginId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PluginId {
    type Error = PluginIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PluginId::parse(&value)
    }
}

impl From<PluginId> for String {
    fn from(id: PluginId) -> Self {
        id.0
    }
}

impl From<PluginIdError> for crate::Error {
    fn from(err: PluginIdError) -> Self {
        crate::Error::InvalidPluginId(err.to_string())
    }
}
