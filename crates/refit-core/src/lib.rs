//! Self-update pipeline for refit.
//!
//! This crate holds everything needed to move an installation from one
//! release to the next without a UI or platform installer:
//! - Archive download with manual redirect handling and interstitial bypass.
//! - Archive validation and safe extraction.
//! - Snapshots of the install tree and manual restore.
//! - In-place file replacement with deferral of files that are in use.
//! - The durable queue of deferred files and its startup drain.
//! - The orchestrator sequencing a whole run.

pub mod backup;
pub mod bypass;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod lock;
pub mod orchestrator;
pub mod pending;
pub mod queue;
pub mod release;
pub mod replace;
pub mod startup;
pub mod validate;
pub mod walk;

/// Snapshot manager for the install tree.
pub use backup::{BackupError, BackupManager, BackupSnapshot};
/// Failure taxonomy shared by every stage.
pub use error::{ErrorClass, UpdateError};
/// Archive extraction into a scratch directory.
pub use extract::{ExtractionError, ExtractionResult, extract};
/// HTTP fetcher and the seam the orchestrator downloads through.
pub use fetch::{DownloadError, DownloadProgress, DownloadResult, Fetch, Fetcher};
/// Cross-process exclusion over an install root.
pub use lock::{LockError, UpdateLock};
/// Pipeline sequencing, progress reporting and restart scheduling.
pub use orchestrator::{
    RelaunchProcess, Restart, RetryPolicy, UpdateOrchestrator, UpdateProgress, UpdateResult,
    UpdateStep,
};
/// Startup drain of deferred replacements.
pub use pending::{PendingError, PendingReport, process_pending_updates};
/// Durable queue of deferred replacements.
pub use queue::{PendingQueue, PendingUpdateEntry, QueueError};
/// Release manifest model, version comparison and manifest cache.
pub use release::{
    ManifestCache, ReleaseChecker, ReleaseError, ReleaseInfo, UpdatePackage, is_newer_version,
};
/// Live-tree file replacement.
pub use replace::{FileReplacer, LockedFileRule, ReplaceError, ReplacementOutcome};
/// Work performed at every launch before anything else.
pub use startup::{StartupReport, cleanup_stale_scratch, run_startup_tasks};
/// Archive signature checks.
pub use validate::{ArchiveKind, ValidationError, validate};
