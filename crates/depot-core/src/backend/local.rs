//! Local file backend
//!
//! The whole store lives in one JSON file (`depot.json` in the data
//! directory), rewritten wholesale on every flush. Writes are atomic: write
//! to a temp file, fsync, then rename over the target.
//!
//! A file that exists but does not parse is copied to
//! `depot.json.corrupt.backup` and the store starts over from defaults.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::{StorageError, StorageResult};
use crate::snapshot::Snapshot;

/// Suffix appended to a data file that failed to parse
const CORRUPT_SUFFIX: &str = "corrupt.backup";

#[derive(Debug, Clone)]
pub struct LocalBackend {
    path: PathBuf,
}

impl LocalBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot from disk
    ///
    /// Returns `None` if the file doesn't exist, or if it was corrupt (the
    /// corrupt file is backed up first). Returns an error only when the file
    /// cannot be read at all.
    pub fn load(&self) -> StorageResult<Option<Snapshot>> {
        match self.read() {
            Ok(snapshot) => Ok(snapshot),
            Err(e @ StorageError::CorruptDocument { .. }) => {
                error!("{} {}", e, e.recovery_suggestion().unwrap_or_default());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`load`](Self::load) but reports a corrupt file as an error
    pub fn read(&self) -> StorageResult<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path).map_err(|source| StorageError::ReadError {
            path: self.path.clone(),
            source,
        })?;

        match Snapshot::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(parse_error) => {
                let backup_path = self.backup_path();
                fs::copy(&self.path, &backup_path)
                    .map_err(|e| StorageError::from_io(e, backup_path.clone()))?;
                Err(StorageError::CorruptDocument {
                    path: self.path.clone(),
                    backup_path,
                    details: parse_error.to_string(),
                })
            }
        }
    }

    /// Write the snapshot to disk atomically
    pub fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let bytes = snapshot.to_json_vec()?;
        atomic_write(&self.path, &bytes)?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), self.path);
        Ok(())
    }

    /// Where a corrupt data file is preserved
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(CORRUPT_SUFFIX);
        PathBuf::from(name)
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    // Same directory, so the rename stays on one filesystem
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
