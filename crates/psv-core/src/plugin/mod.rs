//! Plugin data model: manifests, install descriptors, runtime instances and
//! the registry that owns them.
//!
//! Plugins are arbitrary executables run as subprocesses (no dynamic
//! loading). Each lives in its own directory with a `manifest.json`:
//!
//! ```text
//! <plugins_root>/
//! ├── slack-notify/
//! │   ├── manifest.json
//! │   └── bin/notify.sh
//! └── metrics-exporter/
//!     ├── manifest.json
//!     └── exporter
//! ```

pub mod descriptor;
pub mod instance;
pub mod manifest;
pub mod registry;

pub use descriptor::{materialize_environment, PluginDescriptor, CONFIG_ENV_PREFIX};
pub use instance::{PluginInfo, PluginInstance, PluginStatus};
pub use manifest::{
    load_manifest, parse_checksum, Compatibility, ManifestError, PluginManifest, ResolvedPlugin,
    MANIFEST_FILE_NAME,
};
pub use registry::{Registry, ReserveError};
