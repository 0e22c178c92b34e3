//! Install request and environment materialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Prefix for per-key config environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PLUGIN_CONFIG_";

/// Caller-supplied description of a plugin to install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Package location handed to the fetcher (path or `file://` URL).
    pub source: String,
    /// Key/value overrides exported to the plugin as environment variables.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl PluginDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            source: source.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Render a config key as the suffix of `PLUGIN_CONFIG_<KEY>`.
pub fn config_env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the plugin environment: identity variables plus one
/// `PLUGIN_CONFIG_<KEY>` per scalar config value.
pub fn materialize_environment(
    plugin_id: &str,
    plugin_dir: &Path,
    version: &str,
    config: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PLUGIN_ID".to_string(), plugin_id.to_string());
    env.insert(
        "PLUGIN_DIR".to_string(),
        plugin_dir.display().to_string(),
    );
    env.insert("PLUGIN_VERSION".to_string(), version.to_string());

    for (key, value) in config {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                debug!(plugin_id, key = %key, kind = %json_kind(other), "skipping non-scalar config value");
                continue;
            }
        };
        env.insert(format!("{CONFIG_ENV_PREFIX}{}", config_env_key(key)), rendered);
    }

    env
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
    }
}
