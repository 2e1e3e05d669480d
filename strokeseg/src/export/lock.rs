//! Exclusive advisory lease on a checkpoint directory.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use crate::error::{StrokeSegError, StrokeSegResult};

/// Name of the lock file created inside the checkpoint directory.
pub const LEASE_FILE_NAME: &str = ".export.lock";

/// Held while a checkpoint is written or converted.
///
/// The lease is a lock file created with `create_new`, so a second holder in
/// any process fails immediately with [`StrokeSegError::ArtifactBusy`]. The
/// file is removed when the lease is dropped. A lease left behind by a
/// crashed process has to be removed by hand.
#[derive(Debug)]
pub struct CheckpointLease {
    checkpoint: PathBuf,
    lock_file: PathBuf,
}

impl CheckpointLease {
    /// Acquires the lease on `checkpoint_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactBusy)` if another holder exists,
    /// or `Err(StrokeSegError::Io)` if the lock file cannot be created.
    pub fn acquire(checkpoint_dir: &Path) -> StrokeSegResult<Self> {
        let lock_file = checkpoint_dir.join(LEASE_FILE_NAME);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StrokeSegError::ArtifactBusy {
                    path: checkpoint_dir.to_path_buf(),
                });
            }
            Err(e) => return Err(StrokeSegError::io(&lock_file, e)),
        };

        // Holder pid, for whoever has to clean up a stale lease.
        writeln!(file, "{}", std::process::id()).map_err(|e| StrokeSegError::io(&lock_file, e))?;

        tracing::debug!(checkpoint = %checkpoint_dir.display(), "lease acquired");
        Ok(Self {
            checkpoint: checkpoint_dir.to_path_buf(),
            lock_file,
        })
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }
}

impl Drop for CheckpointLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_file) {
            tracing::warn!(lock = %self.lock_file.display(), error = %e, "failed to release lease");
        } else {
            tracing::debug!(checkpoint = %self.checkpoint.display(), "lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let lease = CheckpointLease::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LEASE_FILE_NAME).exists());
        assert!(matches!(
            CheckpointLease::acquire(dir.path()),
            Err(StrokeSegError::ArtifactBusy { .. })
        ));

        drop(lease);
        assert!(!dir.path().join(LEASE_FILE_NAME).exists());
        assert!(CheckpointLease::acquire(dir.path()).is_ok());
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CheckpointLease::acquire(&dir.path().join("absent")),
            Err(StrokeSegError::Io { .. })
        ));
    }
}
