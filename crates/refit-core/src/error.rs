use std::fmt;

use thiserror::Error;

use crate::backup::BackupError;
use crate::extract::ExtractionError;
use crate::fetch::DownloadError;
use crate::lock::LockError;
use crate::pending::PendingError;
use crate::queue::QueueError;
use crate::replace::ReplaceError;
use crate::validate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    Validation,
    Archive,
    Filesystem,
    Logic,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Archive => "archive",
            Self::Filesystem => "filesystem",
            Self::Logic => "logic",
        };
        f.pad(label)
    }
}

/// Any failure that ends an update run.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("archive validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("file replacement failed: {0}")]
    Replace(#[from] ReplaceError),
    #[error("pending update queue failed: {0}")]
    Queue(#[from] QueueError),
    #[error("pending updates failed: {0}")]
    Pending(#[from] PendingError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Logic(String),
}

impl UpdateError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Queue(QueueError::Malformed { .. })
            | Self::Pending(
                PendingError::MalformedQueue(_) | PendingError::Queue(QueueError::Malformed { .. }),
            )
            | Self::Replace(ReplaceError::Queue(QueueError::Malformed { .. }))
            | Self::Logic(_) => ErrorClass::Logic,
            Self::Download(DownloadError::BypassFailed { .. } | DownloadError::NotAnArchive) => {
                ErrorClass::Validation
            }
            Self::Download(DownloadError::Io { .. }) => ErrorClass::Filesystem,
            Self::Download(_) => ErrorClass::Network,
            Self::Validation(ValidationError::Io { .. } | ValidationError::Missing { .. }) => {
                ErrorClass::Filesystem
            }
            Self::Validation(_) => ErrorClass::Validation,
            Self::Extraction(ExtractionError::Open { .. } | ExtractionError::Write { .. }) => {
                ErrorClass::Filesystem
            }
            Self::Extraction(_) => ErrorClass::Archive,
            Self::Backup(_)
            | Self::Replace(_)
            | Self::Queue(_)
            | Self::Pending(_)
            | Self::Lock(_)
            | Self::Io { .. } => ErrorClass::Filesystem,
        }
    }

    /// Whether the orchestrator may try the failed stage again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download(error) => error.is_transient(),
            Self::Extraction(error) => error.is_retryable(),
            _ => false,
        }
    }
}
