use refit_core::{BackupError, DownloadError, ErrorClass, ReleaseError, UpdateError};
use refit_platform::AppPathsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Client(#[from] DownloadError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{0}")]
    Usage(String),
    #[error("{message}")]
    UpdateFailed {
        message: String,
        class: Option<ErrorClass>,
    },
}

impl CliError {
    /// Process exit status. Failed updates report their failure class so
    /// scripts can tell a flaky network from a broken package.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::UpdateFailed {
                class: Some(class), ..
            } => class_exit_code(*class),
            Self::Update(error) => class_exit_code(error.class()),
            Self::Release(_) | Self::Client(_) => class_exit_code(ErrorClass::Network),
            Self::Backup(_) => class_exit_code(ErrorClass::Filesystem),
            Self::Paths(_) | Self::UpdateFailed { class: None, .. } => 1,
        }
    }
}

fn class_exit_code(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Network => 10,
        ErrorClass::Validation => 11,
        ErrorClass::Archive => 12,
        ErrorClass::Filesystem => 13,
        ErrorClass::Logic => 14,
    }
}
