//! Package transport.
//!
//! The runtime only needs "put the package for `source` at `dest`". The
//! shipped [`LocalFetcher`] handles filesystem paths and `file://` URLs;
//! network transports plug in through the [`Fetcher`] trait.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from fetching a plugin package.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported source scheme {scheme:?} in {source_ref}")]
    UnsupportedScheme { scheme: String, source_ref: String },

    #[error("package not found: {path}")]
    NotFound { path: PathBuf },

    #[error("package source is not a regular file: {path}")]
    NotAFile { path: PathBuf },

    #[error("I/O error fetching {source_ref}: {source}")]
    Io {
        source_ref: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fetches a plugin package to a local path.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, source: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Copies packages from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

impl LocalFetcher {
    /// Map a source string to a local path, rejecting remote schemes.
    pub fn resolve(source: &str) -> Result<PathBuf, FetchError> {
        if let Some(rest) = source.strip_prefix("file://") {
            return Ok(PathBuf::from(rest));
        }
        if let Some((scheme, _)) = source.split_once("://") {
            return Err(FetchError::UnsupportedScheme {
                scheme: scheme.to_string(),
                source_ref: source.to_string(),
            });
        }
        Ok(PathBuf::from(source))
    }
}

impl Fetcher for LocalFetcher {
    fn fetch(&self, source: &str, dest: &Path) -> Result<(), FetchError> {
        let path = Self::resolve(source)?;
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound { path })
            }
            Err(e) => {
                return Err(FetchError::Io {
                    source_ref: source.to_string(),
                    source: e,
                })
            }
        };
        if !metadata.is_file() {
            return Err(FetchError::NotAFile { path });
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FetchError::Io {
                source_ref: source.to_string(),
                source: e,
            })?;
        }
        let bytes = std::fs::copy(&path, dest).map_err(|e| FetchError::Io {
            source_ref: source.to_string(),
            source: e,
        })?;
        debug!(source, dest = %dest.display(), bytes, "package fetched");
        Ok(())
    }
}
