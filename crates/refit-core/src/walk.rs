//! The single recursive directory walk used by backup, replacement and
//! restore.
//!
//! A walk is parameterized by an exclusion predicate (applied to paths
//! relative to the walk root) and, optionally, a mirror destination. When a
//! mirror destination is set, any branch whose mirrored location would land
//! inside the branch itself is skipped, so copying a tree into a location
//! nested under it cannot recurse forever.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Directory names that are never snapshotted or overlaid: dependency
/// caches, temp and backup folders, VCS metadata, and our own staging area.
pub const VOLATILE_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".hg",
    ".svn",
    ".cache",
    "tmp",
    "temp",
    ".tmp",
    "backup",
    "backups",
    crate::queue::STAGING_DIR_NAME,
];

/// Files at any depth that belong to the updater itself.
pub const UPDATER_FILES: &[&str] = &[crate::queue::QUEUE_FILE_NAME, crate::lock::LOCK_FILE_NAME];

#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    dirs: Vec<String>,
    files: Vec<String>,
}

impl Exclusions {
    /// The volatile-subtree list plus the updater's own bookkeeping files.
    #[must_use]
    pub fn volatile() -> Self {
        Self {
            dirs: VOLATILE_DIRS.iter().map(ToString::to_string).collect(),
            files: UPDATER_FILES.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, relative: &Path, is_dir: bool) -> bool {
        let Some(name) = relative.file_name() else {
            return false;
        };
        let list = if is_dir { &self.dirs } else { &self.files };
        list.iter().any(|candidate| name_eq(name, candidate))
    }
}

fn name_eq(name: &OsStr, candidate: &str) -> bool {
    name.to_str()
        .is_some_and(|name| name.eq_ignore_ascii_case(candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub kind: EntryKind,
}

type ExcludeFn<'a> = Box<dyn Fn(&Path, bool) -> bool + 'a>;

pub struct TreeWalker<'a> {
    root: PathBuf,
    exclude: ExcludeFn<'a>,
    mirror: Option<PathBuf>,
}

impl<'a> TreeWalker<'a> {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: resolve(root),
            exclude: Box::new(|_, _| false),
            mirror: None,
        }
    }

    /// Skip every entry (and, for directories, its whole subtree) for which
    /// `predicate(relative_path, is_dir)` returns true.
    #[must_use]
    pub fn exclude(mut self, predicate: impl Fn(&Path, bool) -> bool + 'a) -> Self {
        self.exclude = Box::new(predicate);
        self
    }

    #[must_use]
    pub fn exclusions(self, exclusions: &'a Exclusions) -> Self {
        self.exclude(move |relative, is_dir| exclusions.matches(relative, is_dir))
    }

    /// Enable the self-containment guard for a copy of this tree into
    /// `destination`.
    #[must_use]
    pub fn mirror_into(mut self, destination: &Path) -> Self {
        self.mirror = Some(resolve(destination));
        self
    }

    /// Entries in depth-first order, parents before children, siblings sorted
    /// by name.
    pub fn entries(&self) -> impl Iterator<Item = Result<TreeEntry, walkdir::Error>> + '_ {
        WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| self.keep(entry.path(), entry.file_type().is_dir()))
            .map(move |entry| {
                let entry = entry?;
                let file_type = entry.file_type();
                let kind = if file_type.is_dir() {
                    EntryKind::Dir
                } else if file_type.is_symlink() {
                    EntryKind::Symlink
                } else {
                    EntryKind::File
                };
                let relative = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok(TreeEntry {
                    path: entry.into_path(),
                    relative,
                    kind,
                })
            })
    }

    fn keep(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        if relative.as_os_str().is_empty() {
            return true;
        }
        if (self.exclude)(relative, is_dir) {
            return false;
        }
        match &self.mirror {
            Some(mirror) => !would_self_contain(path, &mirror.join(relative), is_dir),
            None => true,
        }
    }
}

fn would_self_contain(source: &Path, destination: &Path, is_dir: bool) -> bool {
    if is_dir {
        destination.starts_with(source)
    } else {
        destination == source
    }
}

/// Canonical form when the path exists, otherwise the canonical parent joined
/// with the final component, otherwise the path unchanged.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => resolve(parent).join(name),
        _ => path.to_path_buf(),
    }
}
