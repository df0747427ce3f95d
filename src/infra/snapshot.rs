//! File-backed ledger snapshots.
//!
//! The ledger image is written as one JSON document to a temporary file in the
//! same directory and then renamed over the previous snapshot, so a crash
//! leaves either the old or the new snapshot, never a torn one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::core::ledger::LedgerImage;
use crate::core::SnapshotError;

/// Atomic JSON snapshot of a [`LedgerImage`].
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store persisting to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot. `Ok(None)` when none was ever written.
    ///
    /// # Errors
    ///
    /// `SnapshotError::Io` on read failure, `SnapshotError::Codec` on a
    /// malformed document.
    pub fn load(&self) -> Result<Option<LedgerImage>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&self.path, source)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write `image` atomically.
    ///
    /// # Errors
    ///
    /// `SnapshotError::Io` or `SnapshotError::Codec`. The previous snapshot is
    /// left in place on failure.
    pub fn save(&self, image: &LedgerImage) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(image)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "ledger".into(), |n| n.to_string_lossy().into_owned());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path));

        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&self.path, source));
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}
