//! Plugin supervisor common types, IDs, and errors.
//!
//! This crate provides foundational types shared across psv-core modules:
//! - Validated plugin identifiers
//! - The lifecycle error taxonomy with stable codes
//! - Plugin API versioning

pub mod error;
pub mod id;
pub mod schema;

pub use error::{Error, ErrorKind, Result};
pub use id::{PluginId, PluginIdError};
pub use schema::{is_compatible, PLUGIN_API_VERSION};
