//! Persistence hook
//!
//! The kernel hands the would-be committed root to a
//! [`ConfigurationPersister`] before swapping it in. A failure aborts the
//! commit and rolls the submission back.

use crate::resource::Resource;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable store for the committed tree
///
/// Called on the blocking pool while commits are serialized, so an
/// implementation may do synchronous I/O.
pub trait ConfigurationPersister: Send + Sync {
    /// Store the tree about to become current
    ///
    /// # Errors
    /// Any failure to make the tree durable.
    fn store(&self, root: &Resource) -> Result<(), PersistenceError>;
}

/// Keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersister;

impl ConfigurationPersister for NullPersister {
    fn store(&self, _root: &Resource) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Writes the tree as pretty JSON, replacing the file atomically
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    path: PathBuf,
}

impl JsonFilePersister {
    /// Persister writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the last stored tree, if any
    ///
    /// # Errors
    /// I/O or decoding failure of an existing file.
    pub fn load(&self) -> Result<Option<Resource>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigurationPersister for JsonFilePersister {
    fn store(&self, root: &Resource) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(root)?;
        let temp = self.temp_path();
        let replaced = write_synced(&temp, &bytes).and_then(|()| fs::rename(&temp, &self.path));
        if let Err(e) = replaced {
            match fs::remove_file(&temp) {
                Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %temp.display(), error = %cleanup, "stale temp file left behind");
                }
                _ => {}
            }
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "configuration stored");
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Errors storing or loading the tree
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// File system failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Tree could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Store refused the tree
    #[error("store rejected the configuration: {0}")]
    Rejected(String),
}
