use std::path::Path;

use log::{debug, info, warn};

use crate::error::UpdateError;
use crate::lock::{LockError, UpdateLock};
use crate::pending::{PendingReport, process_pending_updates};

/// Prefix of the per-run scratch directories created under the scratch root.
pub const SCRATCH_PREFIX: &str = "refit-update-";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub pending: PendingReport,
    pub scratch_removed: usize,
    /// Set when another process holds the update lock; nothing was touched.
    pub skipped: bool,
}

/// Remove scratch directories left behind by runs that never cleaned up.
pub fn cleanup_stale_scratch(scratch_root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(scratch_root) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
            debug!("Cleaning up update scratch dir: {}", path.display());
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(error) => warn!("Failed to remove {}: {error}", path.display()),
            }
        }
    }
    removed
}

/// Work every launch performs before anything else: drain the pending
/// queue and drop stale scratch directories.
///
/// Both steps are skipped while another process is updating the same
/// install root.
///
/// # Errors
/// Returns an error when the lock cannot be taken for a reason other than
/// contention, or when the pending queue is malformed or unreadable.
pub fn run_startup_tasks(
    install_root: &Path,
    scratch_root: &Path,
) -> Result<StartupReport, UpdateError> {
    let _lock = match UpdateLock::acquire(install_root) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning { .. }) => {
            info!("An update is running elsewhere, skipping startup tasks");
            return Ok(StartupReport {
                skipped: true,
                ..StartupReport::default()
            });
        }
        Err(error) => return Err(error.into()),
    };

    let scratch_removed = cleanup_stale_scratch(scratch_root);
    let pending = process_pending_updates(install_root)?;
    Ok(StartupReport {
        pending,
        scratch_removed,
        skipped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::{SCRATCH_PREFIX, cleanup_stale_scratch, run_startup_tasks};
    use crate::lock::UpdateLock;

    #[test]
    fn removes_only_prefixed_scratch_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(temp.path().join(format!("{SCRATCH_PREFIX}abc/extracted")))
            .expect("scratch dir should be created");
        std::fs::create_dir_all(temp.path().join("keep-me")).expect("dir should be created");

        assert_eq!(cleanup_stale_scratch(temp.path()), 1);
        assert!(temp.path().join("keep-me").is_dir());
        assert_eq!(cleanup_stale_scratch(&temp.path().join("missing")), 0);
    }

    #[test]
    fn startup_tasks_yield_to_a_running_update() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let install = temp.path().join("install");
        let scratch = temp.path().join("scratch");
        std::fs::create_dir_all(scratch.join(format!("{SCRATCH_PREFIX}busy")))
            .expect("scratch dir should be created");

        let held = UpdateLock::acquire(&install).expect("lock should be acquired");
        let report = run_startup_tasks(&install, &scratch).expect("startup should succeed");
        assert!(report.skipped);
        assert!(scratch.join(format!("{SCRATCH_PREFIX}busy")).is_dir());

        drop(held);
        let report = run_startup_tasks(&install, &scratch).expect("startup should succeed");
        assert!(!report.skipped);
        assert_eq!(report.scratch_removed, 1);
    }
}
