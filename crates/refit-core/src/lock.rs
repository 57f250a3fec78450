use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

pub const LOCK_FILE_NAME: &str = ".refit-update.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another update is already running for {install_root}")]
    AlreadyRunning { install_root: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive advisory lock over an install root, held for the lifetime of
/// the guard.
#[derive(Debug)]
pub struct UpdateLock {
    file: File,
    path: PathBuf,
}

impl UpdateLock {
    /// # Errors
    /// Returns [`LockError::AlreadyRunning`] when another process (or another
    /// guard in this process) holds the lock.
    pub fn acquire(install_root: &Path) -> Result<Self, LockError> {
        std::fs::create_dir_all(install_root)
            .map_err(|error| LockError::io("failed to create install root", error))?;
        let path = install_root.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|error| LockError::io("failed to open update lock file", error))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                return Err(LockError::AlreadyRunning {
                    install_root: install_root.display().to_string(),
                });
            }
            Err(error) => return Err(LockError::io("failed to acquire update lock", error)),
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|error| LockError::io("failed to write update lock metadata", error))?;

        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, UpdateLock};

    #[test]
    fn second_acquire_reports_already_running() {
        let temp = tempfile::tempdir().expect("tempdir should be created");

        let first = UpdateLock::acquire(temp.path()).expect("first lock should succeed");
        let second = UpdateLock::acquire(temp.path());

        assert!(matches!(second, Err(LockError::AlreadyRunning { .. })));
        let pid = std::fs::read_to_string(first.path()).expect("lock file should be readable");
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir should be created");

        drop(UpdateLock::acquire(temp.path()).expect("first lock should succeed"));
        assert!(UpdateLock::acquire(temp.path()).is_ok());
    }
}
