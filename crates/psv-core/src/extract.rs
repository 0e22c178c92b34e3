//! Package extraction.
//!
//! Plugin packages are ZIP archives whose root becomes the plugin
//! directory. Entries that would land outside the destination (absolute
//! paths, `..`) reject the whole archive. Unix permission bits stored in the
//! archive are restored so entry points stay executable.

use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from extracting a plugin package.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("corrupt or unsupported archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive entry escapes the destination: {name}")]
    UnsafePath { name: String },

    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unpacks a fetched package into the plugin directory.
pub trait Extractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError>;
}

/// ZIP extractor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        let file = File::open(archive).map_err(|source| ExtractError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
        let mut zip = zip::ZipArchive::new(file)?;

        // Validate every name before writing anything.
        for i in 0..zip.len() {
            let entry = zip.by_index(i)?;
            if entry.enclosed_name().is_none() {
                return Err(ExtractError::UnsafePath {
                    name: entry.name().to_string(),
                });
            }
        }

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(ExtractError::UnsafePath {
                    name: entry.name().to_string(),
                });
            };
            let out_path = dest.join(relative);
            let io_err = |source| ExtractError::Io {
                path: out_path.clone(),
                source,
            };

            if entry.is_dir() {
                std::fs::create_dir_all(&out_path).map_err(io_err)?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            let mut out = File::create(&out_path).map_err(io_err)?;
            std::io::copy(&mut entry, &mut out).map_err(io_err)?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o777))
                    .map_err(io_err)?;
            }
        }

        debug!(
            archive = %archive.display(),
            dest = %dest.display(),
            entries = zip.len(),
            "package extracted"
        );
        Ok(())
    }
}
