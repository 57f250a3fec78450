//! The durable list of file replacements deferred past a restart.
//!
//! The queue lives at a fixed path under the install root. It is either
//! absent (no pending work) or a JSON array of entries whose sources sit in
//! the staging area next to it.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const QUEUE_FILE_NAME: &str = ".refit-pending.json";
pub const STAGING_DIR_NAME: &str = ".refit-staging";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdateEntry {
    #[serde(rename = "src")]
    pub source_path: PathBuf,
    #[serde(rename = "dest")]
    pub destination_path: PathBuf,
    #[serde(rename = "relativePath")]
    pub relative_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("pending update queue {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl QueueError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

#[derive(Debug, Clone)]
pub struct PendingQueue {
    install_root: PathBuf,
}

impl PendingQueue {
    #[must_use]
    pub fn new(install_root: &Path) -> Self {
        Self {
            install_root: install_root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.install_root.join(QUEUE_FILE_NAME)
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.install_root.join(STAGING_DIR_NAME)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Read the queue. A missing file is an empty queue.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or does not parse.
    pub fn load(&self) -> Result<Vec<PendingUpdateEntry>, QueueError> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(QueueError::io("failed to read pending update queue", error)),
        };
        serde_json::from_str(&content).map_err(|source| QueueError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }

    /// Read-merge-write. A corrupt existing queue is treated as empty; an
    /// entry for a destination already queued replaces the older one.
    ///
    /// # Errors
    /// Returns an error when the merged queue cannot be written.
    pub fn append(&self, entries: &[PendingUpdateEntry]) -> Result<usize, QueueError> {
        let mut merged = match self.load() {
            Ok(existing) => existing,
            Err(error) => {
                warn!("Discarding unreadable pending update queue: {error}");
                Vec::new()
            }
        };

        for entry in entries {
            merged.retain(|queued| queued.destination_path != entry.destination_path);
            merged.push(entry.clone());
        }

        self.write(&merged)?;
        debug!(
            "Pending update queue now holds {} entries at {}",
            merged.len(),
            self.path().display()
        );
        Ok(merged.len())
    }

    fn write(&self, entries: &[PendingUpdateEntry]) -> Result<(), QueueError> {
        std::fs::create_dir_all(&self.install_root)
            .map_err(|error| QueueError::io("failed to create install root", error))?;
        let content = serde_json::to_vec_pretty(entries).map_err(|source| QueueError::Malformed {
            path: self.path().display().to_string(),
            source,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.install_root)
            .map_err(|error| QueueError::io("failed to create temporary queue file", error))?;
        temp.write_all(&content)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|error| QueueError::io("failed to write pending update queue", error))?;
        temp.persist(self.path())
            .map_err(|error| QueueError::io("failed to persist pending update queue", error.error))?;
        Ok(())
    }

    /// Delete the queue file and the staging area.
    ///
    /// # Errors
    /// Returns an error when the queue file exists but cannot be removed.
    pub fn clear(&self) -> Result<(), QueueError> {
        match std::fs::remove_file(self.path()) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(QueueError::io("failed to remove pending update queue", error));
            }
        }

        let staging = self.staging_dir();
        if staging.exists()
            && let Err(error) = std::fs::remove_dir_all(&staging)
        {
            warn!(
                "Failed to remove staging directory {}: {error}",
                staging.display()
            );
        }
        Ok(())
    }
}
