use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::walk::{EntryKind, Exclusions, TreeWalker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub files_copied: usize,
    pub files_skipped: usize,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("install root {path} is not readable: {source}")]
    InstallRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {name} does not exist")]
    UnknownSnapshot { name: String },
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },
}

impl BackupError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Snapshots of the install tree stored under a directory outside of it.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
    exclusions: Exclusions,
}

impl BackupManager {
    #[must_use]
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            exclusions: Exclusions::volatile(),
        }
    }

    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy `install_root` into a new timestamped snapshot directory.
    ///
    /// Copying is best-effort: unreadable files are logged and counted, and
    /// only failing to create the snapshot itself (or to read the install
    /// root at all) is an error.
    ///
    /// # Errors
    /// Returns an error when the install root cannot be read or the snapshot
    /// directory cannot be created.
    pub fn backup(&self, install_root: &Path) -> Result<BackupSnapshot, BackupError> {
        std::fs::read_dir(install_root).map_err(|source| BackupError::InstallRoot {
            path: install_root.display().to_string(),
            source,
        })?;

        let created_at = Utc::now();
        let backup_path = self.create_snapshot_dir(&created_at)?;
        info!(
            "Backing up {} to {}",
            install_root.display(),
            backup_path.display()
        );

        let walker = TreeWalker::new(install_root)
            .exclusions(&self.exclusions)
            .mirror_into(&backup_path);

        let mut files_copied = 0;
        let mut files_skipped = 0;
        for entry in walker.entries() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("Backup skipped unreadable entry: {error}");
                    files_skipped += 1;
                    continue;
                }
            };
            let destination = backup_path.join(&entry.relative);
            let copied = match entry.kind {
                EntryKind::Dir => std::fs::create_dir_all(&destination),
                EntryKind::File => std::fs::copy(&entry.path, &destination).map(|_| ()),
                EntryKind::Symlink => {
                    debug!("Backup skipped symbolic link {}", entry.path.display());
                    continue;
                }
            };
            match copied {
                Ok(()) if entry.kind == EntryKind::File => files_copied += 1,
                Ok(()) => {}
                Err(error) => {
                    warn!(
                        "Backup could not copy {}: {error}",
                        entry.path.display()
                    );
                    files_skipped += 1;
                }
            }
        }

        info!("Backup complete: {files_copied} files copied, {files_skipped} skipped");
        Ok(BackupSnapshot {
            backup_path,
            created_at,
            files_copied,
            files_skipped,
        })
    }

    fn create_snapshot_dir(&self, created_at: &DateTime<Utc>) -> Result<PathBuf, BackupError> {
        std::fs::create_dir_all(&self.backup_root).map_err(|error| {
            BackupError::io("failed to create backup root", &self.backup_root, error)
        })?;

        let stamp = created_at.format("%Y%m%d-%H%M%S").to_string();
        let mut candidate = self.backup_root.join(&stamp);
        let mut suffix = 1;
        loop {
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = self.backup_root.join(format!("{stamp}-{suffix}"));
                    suffix += 1;
                }
                Err(error) => {
                    return Err(BackupError::io(
                        "failed to create snapshot directory",
                        &candidate,
                        error,
                    ));
                }
            }
        }
    }

    /// Snapshot directories, newest first.
    ///
    /// # Errors
    /// Returns an error when the backup root exists but cannot be listed.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>, BackupError> {
        let entries = match std::fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(BackupError::io(
                    "failed to list backups in",
                    &self.backup_root,
                    error,
                ));
            }
        };

        let mut snapshots: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        snapshots.sort_by_key(|path| std::cmp::Reverse(snapshot_sort_key(path)));
        Ok(snapshots)
    }

    /// Delete all but the newest `keep` snapshots.
    ///
    /// # Errors
    /// Returns an error when the snapshots cannot be listed or one of them
    /// cannot be removed.
    pub fn prune(&self, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
        let removed: Vec<PathBuf> = self.list_snapshots()?.into_iter().skip(keep).collect();
        for path in &removed {
            std::fs::remove_dir_all(path)
                .map_err(|error| BackupError::io("failed to remove snapshot", path, error))?;
            info!("Pruned backup {}", path.display());
        }
        Ok(removed)
    }

    /// Resolve a snapshot by directory name.
    ///
    /// # Errors
    /// Returns [`BackupError::UnknownSnapshot`] when no such snapshot exists.
    pub fn snapshot_named(&self, name: &str) -> Result<PathBuf, BackupError> {
        let path = self.backup_root.join(name);
        let inside_root = Path::new(name).components().count() == 1;
        if inside_root && path.is_dir() {
            Ok(path)
        } else {
            Err(BackupError::UnknownSnapshot {
                name: name.to_string(),
            })
        }
    }

    /// Copy a snapshot back over the install tree. Manual recovery only; the
    /// update pipeline never calls this.
    ///
    /// # Errors
    /// Returns an error on the first file that cannot be restored.
    pub fn restore(&self, snapshot: &Path, install_root: &Path) -> Result<usize, BackupError> {
        info!(
            "Restoring {} from {}",
            install_root.display(),
            snapshot.display()
        );
        let walker = TreeWalker::new(snapshot)
            .exclusions(&self.exclusions)
            .mirror_into(install_root);

        let mut restored = 0;
        for entry in walker.entries() {
            let entry = entry.map_err(|source| BackupError::Walk {
                path: snapshot.display().to_string(),
                source,
            })?;
            let destination = install_root.join(&entry.relative);
            match entry.kind {
                EntryKind::Dir => std::fs::create_dir_all(&destination).map_err(|error| {
                    BackupError::io("failed to recreate directory", &destination, error)
                })?,
                EntryKind::File => {
                    std::fs::copy(&entry.path, &destination).map_err(|error| {
                        BackupError::io("failed to restore file", &destination, error)
                    })?;
                    restored += 1;
                }
                EntryKind::Symlink => {}
            }
        }
        Ok(restored)
    }
}

fn snapshot_sort_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // "20250101-120000-2" sorts after "20250101-120000-1" and the bare stamp
    match name.get(15..).and_then(|rest| rest.strip_prefix('-')) {
        Some(suffix) => (name[..15].to_string(), suffix.parse().unwrap_or(0)),
        None => (name, 0),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{BackupError, BackupManager};

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file should have a parent"))
            .expect("parent directory should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    #[test]
    fn backup_copies_tree_without_volatile_subtrees() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let install = temp.path().join("install");
        write(&install, "app/main.js", "main");
        write(&install, "config.json", "{}");
        write(&install, "node_modules/dep/index.js", "dep");
        write(&install, ".git/HEAD", "ref");

        let manager = BackupManager::new(temp.path().join("backups"));
        let snapshot = manager.backup(&install).expect("backup should succeed");

        assert_eq!(snapshot.files_copied, 2);
        assert_eq!(snapshot.files_skipped, 0);
        assert!(snapshot.backup_path.join("app/main.js").is_file());
        assert!(snapshot.backup_path.join("config.json").is_file());
        assert!(!snapshot.backup_path.join("node_modules").exists());
        assert!(!snapshot.backup_path.join(".git").exists());
    }

    #[test]
    fn backup_of_missing_install_root_fails() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = BackupManager::new(temp.path().join("backups"));

        let error = manager
            .backup(&temp.path().join("missing"))
            .expect_err("missing install root should fail");
        assert!(matches!(error, BackupError::InstallRoot { .. }));
    }

    #[test]
    fn backups_in_same_second_get_distinct_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let install = temp.path().join("install");
        write(&install, "a.txt", "a");
        let manager = BackupManager::new(temp.path().join("backups"));

        let first = manager.backup(&install).expect("first backup should succeed");
        let second = manager.backup(&install).expect("second backup should succeed");

        assert_ne!(first.backup_path, second.backup_path);
        assert_eq!(manager.list_snapshots().expect("list should succeed").len(), 2);
    }

    #[test]
    fn prune_keeps_newest_snapshots() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = temp.path().join("backups");
        for name in ["20240101-000000", "20240301-000000", "20240201-000000"] {
            std::fs::create_dir_all(root.join(name)).expect("snapshot dir should be created");
        }
        let manager = BackupManager::new(&root);

        let removed = manager.prune(2).expect("prune should succeed");

        assert_eq!(removed, vec![root.join("20240101-000000")]);
        assert_eq!(
            manager.list_snapshots().expect("list should succeed"),
            vec![root.join("20240301-000000"), root.join("20240201-000000")]
        );
    }

    #[test]
    fn restore_copies_snapshot_back() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let install = temp.path().join("install");
        write(&install, "bin/tool.cfg", "original");
        let manager = BackupManager::new(temp.path().join("backups"));
        let snapshot = manager.backup(&install).expect("backup should succeed");

        write(&install, "bin/tool.cfg", "broken");
        let name = snapshot
            .backup_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("snapshot should have a UTF-8 name");
        let located = manager.snapshot_named(name).expect("snapshot should resolve");
        let restored = manager
            .restore(&located, &install)
            .expect("restore should succeed");

        assert_eq!(restored, 1);
        assert_eq!(
            std::fs::read_to_string(install.join("bin/tool.cfg")).expect("file should exist"),
            "original"
        );
        assert!(matches!(
            manager.snapshot_named("../install"),
            Err(BackupError::UnknownSnapshot { .. })
        ));
    }
}
