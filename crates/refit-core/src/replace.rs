//! Overlay an extracted release onto the live install tree.
//!
//! Files that cannot be overwritten while the current process runs are not
//! treated as failures: they are staged next to the install tree and queued
//! for the next startup.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::queue::{PendingQueue, PendingUpdateEntry, QueueError};
use crate::walk::{EntryKind, Exclusions, TreeEntry, TreeWalker};

/// Shared libraries the OS loader keeps mapped while running, and runtime
/// data blobs opened at startup (`icudtl.dat`, `v8_context_snapshot.bin`).
const LOCKED_EXTENSIONS: &[&str] = &["dll", "so", "dylib", "node", "pak", "asar", "dat", "bin"];

#[cfg(unix)]
const LOCK_OS_ERRORS: &[i32] = &[
    1,  // EPERM
    13, // EACCES
    16, // EBUSY
    26, // ETXTBSY
];

#[cfg(windows)]
const LOCK_OS_ERRORS: &[i32] = &[
    5,  // ERROR_ACCESS_DENIED
    32, // ERROR_SHARING_VIOLATION
    33, // ERROR_LOCK_VIOLATION
];

#[cfg(not(any(unix, windows)))]
const LOCK_OS_ERRORS: &[i32] = &[];

/// Files deferred without attempting a copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockedFileRule;

impl LockedFileRule {
    #[must_use]
    pub fn matches(self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        let name = name.to_ascii_lowercase();

        // libfoo.so.1.2 style versioned shared objects
        if name.contains(".so.") {
            return true;
        }
        name.rsplit_once('.')
            .is_some_and(|(_, ext)| LOCKED_EXTENSIONS.contains(&ext))
    }
}

/// Whether a copy failure means "in use right now" rather than "broken".
#[must_use]
pub fn is_lock_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ResourceBusy | ErrorKind::ExecutableFileBusy
    ) || error
        .raw_os_error()
        .is_some_and(|code| LOCK_OS_ERRORS.contains(&code))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementOutcome {
    pub replaced_files: usize,
    pub locked_files: Vec<PathBuf>,
    pub skipped_files: Vec<PathBuf>,
    pub pending_restart: bool,
}

#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("failed to walk new release tree: {0}")]
    Walk(#[source] walkdir::Error),
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ReplaceError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileReplacer {
    exclusions: Exclusions,
    locked_rule: LockedFileRule,
    running_executable: Option<PathBuf>,
    copy_file: fn(&Path, &Path) -> std::io::Result<()>,
}

impl Default for FileReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReplacer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            exclusions: Exclusions::volatile(),
            locked_rule: LockedFileRule,
            running_executable: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.canonicalize().ok()),
            copy_file: overwrite,
        }
    }

    #[must_use]
    pub fn with_running_executable(mut self, executable: Option<PathBuf>) -> Self {
        self.running_executable = executable.map(|exe| exe.canonicalize().unwrap_or(exe));
        self
    }

    /// Copy every file of `new_tree_root` over `install_root`.
    ///
    /// # Errors
    /// Returns an error when the new tree cannot be walked, a directory cannot
    /// be created, a copy fails for a reason other than the file being in use,
    /// or the deferred work cannot be persisted.
    pub fn replace(
        &self,
        new_tree_root: &Path,
        install_root: &Path,
    ) -> Result<ReplacementOutcome, ReplaceError> {
        let queue = PendingQueue::new(install_root);
        let walker = TreeWalker::new(new_tree_root)
            .exclusions(&self.exclusions)
            .mirror_into(install_root);

        let mut outcome = ReplacementOutcome::default();
        let mut deferred = Vec::new();
        let overlaid = self.overlay(&walker, install_root, &queue, &mut outcome, &mut deferred);

        // Staged files are queued even when a later entry aborts the run.
        let queued = if deferred.is_empty() {
            Ok(0)
        } else {
            queue.append(&deferred)
        };
        if let (Err(_), Err(error)) = (&overlaid, &queued) {
            warn!("Failed to queue deferred files after aborted replacement: {error}");
        }
        overlaid?;
        queued?;
        if !deferred.is_empty() {
            info!(
                "Deferred {} locked files until next start",
                deferred.len()
            );
        }
        outcome.pending_restart = !outcome.locked_files.is_empty();

        info!(
            "Replacement finished: {} replaced, {} deferred, {} skipped",
            outcome.replaced_files,
            outcome.locked_files.len(),
            outcome.skipped_files.len()
        );
        Ok(outcome)
    }

    fn overlay(
        &self,
        walker: &TreeWalker<'_>,
        install_root: &Path,
        queue: &PendingQueue,
        outcome: &mut ReplacementOutcome,
        deferred: &mut Vec<PendingUpdateEntry>,
    ) -> Result<(), ReplaceError> {
        for entry in walker.entries() {
            let entry = entry.map_err(ReplaceError::Walk)?;
            let destination = install_root.join(&entry.relative);

            match entry.kind {
                EntryKind::Dir => {
                    std::fs::create_dir_all(&destination).map_err(|error| {
                        ReplaceError::io("failed to create directory", &destination, error)
                    })?;
                }
                EntryKind::Symlink => {
                    warn!("Skipping symbolic link in release: {}", entry.relative.display());
                    outcome.skipped_files.push(entry.relative);
                }
                EntryKind::File => {
                    if let Some(pending) =
                        self.replace_file(&entry, &destination, queue, outcome)?
                    {
                        deferred.push(pending);
                    }
                }
            }
        }
        Ok(())
    }

    fn replace_file(
        &self,
        entry: &TreeEntry,
        destination: &Path,
        queue: &PendingQueue,
        outcome: &mut ReplacementOutcome,
    ) -> Result<Option<PendingUpdateEntry>, ReplaceError> {
        if self.is_running_executable(destination) {
            info!(
                "Skipping running executable {}",
                destination.display()
            );
            outcome.skipped_files.push(entry.relative.clone());
            return Ok(None);
        }

        if self.locked_rule.matches(&entry.relative) {
            debug!(
                "Deferring runtime file without copying: {}",
                entry.relative.display()
            );
            return stage(entry, destination, queue, outcome).map(Some);
        }

        match (self.copy_file)(&entry.path, destination) {
            Ok(()) => {
                outcome.replaced_files += 1;
                Ok(None)
            }
            Err(error) if is_lock_error(&error) => {
                debug!(
                    "{} is in use ({error}), deferring",
                    destination.display()
                );
                stage(entry, destination, queue, outcome).map(Some)
            }
            Err(error) => Err(ReplaceError::io("failed to replace", destination, error)),
        }
    }

    fn is_running_executable(&self, destination: &Path) -> bool {
        let Some(running) = &self.running_executable else {
            return false;
        };
        destination
            .canonicalize()
            .is_ok_and(|destination| destination == *running)
    }
}

fn overwrite(source: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, destination).map(|_| ())
}

/// Copy the new file into the staging area so it outlives the extraction
/// scratch directory, and describe the deferred replacement.
fn stage(
    entry: &TreeEntry,
    destination: &Path,
    queue: &PendingQueue,
    outcome: &mut ReplacementOutcome,
) -> Result<PendingUpdateEntry, ReplaceError> {
    let staged = queue.staging_dir().join(&entry.relative);
    overwrite(&entry.path, &staged)
        .map_err(|error| ReplaceError::io("failed to stage deferred file", &staged, error))?;

    outcome.locked_files.push(entry.relative.clone());
    Ok(PendingUpdateEntry {
        source_path: staged,
        destination_path: destination.to_path_buf(),
        relative_path: entry.relative.clone(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{FileReplacer, LockedFileRule, ReplaceError, is_lock_error};
    use crate::queue::PendingQueue;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file should have a parent"))
            .expect("parent directory should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    #[test]
    fn locked_rule_matches_runtime_files() {
        let rule = LockedFileRule;

        assert!(rule.matches(Path::new("app.dll")));
        assert!(rule.matches(Path::new("lib/libffmpeg.SO")));
        assert!(rule.matches(Path::new("lib/libssl.so.3")));
        assert!(rule.matches(Path::new("Frameworks/engine.dylib")));
        assert!(rule.matches(Path::new("resources/app.asar")));
        assert!(rule.matches(Path::new("v8_context_snapshot.bin")));
        assert!(!rule.matches(Path::new("readme.txt")));
        assert!(rule.matches(Path::new("data/levels.bin")));
        assert!(rule.matches(Path::new("resources/locale.DAT")));
        assert!(!rule.matches(Path::new("solution.sol")));
    }

    #[test]
    fn lock_error_classification() {
        use std::io::{Error, ErrorKind};

        assert!(is_lock_error(&Error::from(ErrorKind::PermissionDenied)));
        assert!(is_lock_error(&Error::from(ErrorKind::ResourceBusy)));
        assert!(is_lock_error(&Error::from(ErrorKind::ExecutableFileBusy)));
        assert!(!is_lock_error(&Error::from(ErrorKind::NotFound)));
        assert!(!is_lock_error(&Error::from(ErrorKind::StorageFull)));
    }

    #[test]
    fn replace_copies_ordinary_files_and_creates_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "readme.txt", "new readme");
        write(&new_tree, "assets/icons/app.png", "png");
        write(&install, "readme.txt", "old readme");
        write(&install, "user-data.json", "keep");

        let outcome = FileReplacer::new()
            .with_running_executable(None)
            .replace(&new_tree, &install)
            .expect("replacement should succeed");

        assert_eq!(outcome.replaced_files, 2);
        assert!(!outcome.pending_restart);
        assert_eq!(
            std::fs::read_to_string(install.join("readme.txt")).expect("readme should exist"),
            "new readme"
        );
        assert!(install.join("assets/icons/app.png").is_file());
        assert!(install.join("user-data.json").is_file());
        assert!(!PendingQueue::new(&install).exists());
    }

    #[test]
    fn replace_defers_locked_files_without_overwriting() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "bin/core.dll", "new core");
        write(&install, "bin/core.dll", "old core");

        let outcome = FileReplacer::new()
            .with_running_executable(None)
            .replace(&new_tree, &install)
            .expect("replacement should succeed");

        assert_eq!(outcome.locked_files, vec![PathBuf::from("bin/core.dll")]);
        assert!(outcome.pending_restart);
        assert_eq!(
            std::fs::read_to_string(install.join("bin/core.dll")).expect("dll should exist"),
            "old core"
        );

        let queued = PendingQueue::new(&install)
            .load()
            .expect("queue should load");
        assert_eq!(queued.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&queued[0].source_path).expect("staged file should exist"),
            "new core"
        );
        assert_eq!(queued[0].destination_path, install.join("bin/core.dll"));
    }

    #[test]
    fn replace_skips_running_executable() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "tool", "new tool");
        write(&install, "tool", "running tool");

        let outcome = FileReplacer::new()
            .with_running_executable(Some(install.join("tool")))
            .replace(&new_tree, &install)
            .expect("replacement should succeed");

        assert_eq!(outcome.skipped_files, vec![PathBuf::from("tool")]);
        assert_eq!(outcome.replaced_files, 0);
        assert_eq!(
            std::fs::read_to_string(install.join("tool")).expect("tool should exist"),
            "running tool"
        );
    }

    #[test]
    fn replace_ignores_volatile_subtrees_in_release() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "node_modules/dep/index.js", "dep");
        write(&new_tree, "main.js", "main");

        let outcome = FileReplacer::new()
            .with_running_executable(None)
            .replace(&new_tree, &install)
            .expect("replacement should succeed");

        assert_eq!(outcome.replaced_files, 1);
        assert!(!install.join("node_modules").exists());
    }

    #[test]
    fn unexpected_copy_error_aborts_replacement() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "config", "file in release");
        std::fs::create_dir_all(install.join("config").join("nested"))
            .expect("conflicting directory should be created");

        let error = FileReplacer::new()
            .with_running_executable(None)
            .replace(&new_tree, &install)
            .expect_err("file over directory should fail");

        assert!(matches!(error, ReplaceError::Io { .. }));
    }

    #[test]
    fn aborted_replacement_still_queues_staged_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "a/core.dll", "new core");
        write(&new_tree, "z_config", "file in release");
        std::fs::create_dir_all(install.join("z_config").join("nested"))
            .expect("conflicting directory should be created");

        FileReplacer::new()
            .with_running_executable(None)
            .replace(&new_tree, &install)
            .expect_err("file over directory should fail");

        let queue = PendingQueue::new(&install);
        let queued = queue.load().expect("queue should load");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].relative_path, PathBuf::from("a/core.dll"));
        assert!(queued[0].source_path.starts_with(queue.staging_dir()));

        let report =
            crate::pending::process_pending_updates(&install).expect("pending should apply");
        assert_eq!(report.processed, 1);
        assert_eq!(
            std::fs::read_to_string(install.join("a/core.dll")).expect("dll should exist"),
            "new core"
        );
        assert!(!queue.staging_dir().exists());
    }

    fn busy_for_cfg(source: &Path, destination: &Path) -> std::io::Result<()> {
        if destination.extension().is_some_and(|ext| ext == "cfg") {
            return Err(std::io::Error::from(std::io::ErrorKind::ResourceBusy));
        }
        super::overwrite(source, destination)
    }

    #[test]
    fn busy_destination_is_deferred_instead_of_failing() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let new_tree = temp.path().join("new");
        let install = temp.path().join("install");
        write(&new_tree, "settings.cfg", "new settings");
        write(&new_tree, "readme.txt", "new readme");
        write(&install, "settings.cfg", "old settings");

        let replacer = FileReplacer {
            copy_file: busy_for_cfg,
            ..FileReplacer::new().with_running_executable(None)
        };
        let outcome = replacer
            .replace(&new_tree, &install)
            .expect("busy file should not fail replacement");

        assert_eq!(outcome.replaced_files, 1);
        assert_eq!(outcome.locked_files, vec![PathBuf::from("settings.cfg")]);
        assert!(outcome.pending_restart);
        assert_eq!(
            std::fs::read_to_string(install.join("settings.cfg")).expect("cfg should exist"),
            "old settings"
        );

        let queued = PendingQueue::new(&install)
            .load()
            .expect("queue should load");
        assert_eq!(queued.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&queued[0].source_path).expect("staged file should exist"),
            "new settings"
        );
    }
}
