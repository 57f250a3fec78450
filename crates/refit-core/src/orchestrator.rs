use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backup::BackupManager;
use crate::error::{ErrorClass, UpdateError};
use crate::extract::{ExtractionResult, extract};
use crate::fetch::{DownloadProgress, DownloadResult, Fetch};
use crate::lock::UpdateLock;
use crate::release::UpdatePackage;
use crate::replace::{FileReplacer, ReplacementOutcome};
use crate::startup::SCRATCH_PREFIX;
use crate::validate::validate;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStep {
    Idle,
    Downloading,
    Extracting,
    BackingUp,
    Replacing,
    CleaningUp,
    Complete,
    Error,
}

impl UpdateStep {
    /// Stages only move forward one at a time; `Error` is reachable from any
    /// stage that has started.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use UpdateStep::{
            BackingUp, CleaningUp, Complete, Downloading, Error, Extracting, Idle, Replacing,
        };
        match (self, next) {
            (Idle, Downloading)
            | (Downloading, Extracting)
            | (Extracting, BackingUp)
            | (BackingUp, Replacing)
            | (Replacing, CleaningUp)
            | (CleaningUp, Complete) => true,
            (Idle | Complete | Error, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::BackingUp => "backing up",
            Self::Replacing => "replacing",
            Self::CleaningUp => "cleaning up",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateProgress {
    pub step: UpdateStep,
    /// 0-100 within the current step.
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub outcome: Option<ReplacementOutcome>,
    pub restart_scheduled: bool,
}

impl UpdateResult {
    fn failure(error: &UpdateError) -> Self {
        Self {
            success: false,
            message: format!("Update failed: {error}"),
            error: Some(error.to_string()),
            error_class: Some(error.class()),
            outcome: None,
            restart_scheduled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub download_attempts: u32,
    pub download_delay: Duration,
    pub extract_attempts: u32,
    pub extract_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            download_attempts: 3,
            download_delay: Duration::from_secs(2),
            extract_attempts: 5,
            extract_delay: Duration::from_millis(500),
        }
    }
}

/// Starts the freshly installed version. Called once the restart delay has
/// elapsed; the caller is expected to exit afterwards.
pub trait Restart: Send + Sync {
    /// # Errors
    /// Returns an error when the new process cannot be started.
    fn relaunch(&self) -> std::io::Result<()>;
}

/// Relaunch the current executable with a fixed argument list.
#[derive(Debug, Clone, Default)]
pub struct RelaunchProcess {
    args: Vec<OsString>,
}

impl RelaunchProcess {
    #[must_use]
    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Restart for RelaunchProcess {
    fn relaunch(&self) -> std::io::Result<()> {
        let exe = relaunch_target(std::env::current_exe()?);
        info!("Restarting from: {}", exe.display());
        std::process::Command::new(&exe)
            .args(&self.args)
            .spawn()
            .map(|_| ())
    }
}

// After the binary is swapped on Linux, /proc/self/exe points at the old
// unlinked inode and current_exe() carries a " (deleted)" suffix.
fn relaunch_target(exe: PathBuf) -> PathBuf {
    let path_str = exe.to_string_lossy();
    if let Some(fixed) = path_str.strip_suffix(" (deleted)") {
        let fixed = PathBuf::from(fixed);
        info!("Adjusted exe path from deleted inode: {}", fixed.display());
        fixed
    } else {
        exe
    }
}

struct StepTracker {
    current: UpdateStep,
    progress: mpsc::Sender<UpdateProgress>,
}

impl StepTracker {
    fn new(progress: mpsc::Sender<UpdateProgress>) -> Self {
        Self {
            current: UpdateStep::Idle,
            progress,
        }
    }

    async fn advance(&mut self, next: UpdateStep, message: String) -> Result<(), UpdateError> {
        if !self.current.can_transition_to(next) {
            return Err(UpdateError::Logic(format!(
                "illegal update transition from {} to {next}",
                self.current
            )));
        }
        debug!("Update step {} -> {next}", self.current);
        self.current = next;
        self.report(0, message).await;
        Ok(())
    }

    async fn report(&self, progress: u8, message: String) {
        let _ = self
            .progress
            .send(UpdateProgress {
                step: self.current,
                progress: progress.min(100),
                message,
            })
            .await;
    }

    async fn fail(&mut self, error: &UpdateError) {
        if self.current.can_transition_to(UpdateStep::Error) {
            self.current = UpdateStep::Error;
            self.report(100, error.to_string()).await;
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sequences one update run: download, extract, back up, replace, clean up,
/// and schedule a restart.
pub struct UpdateOrchestrator {
    install_root: PathBuf,
    scratch_root: PathBuf,
    backups: BackupManager,
    backup_retention: Option<usize>,
    replacer: FileReplacer,
    fetcher: Arc<dyn Fetch>,
    restart: Option<Arc<dyn Restart>>,
    restart_delay: Duration,
    retry: RetryPolicy,
    running: AtomicBool,
    scheduled_restart: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateOrchestrator {
    #[must_use]
    pub fn new(
        install_root: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            scratch_root: scratch_root.into(),
            backups: BackupManager::new(backup_root),
            backup_retention: None,
            replacer: FileReplacer::new(),
            fetcher,
            restart: None,
            restart_delay: DEFAULT_RESTART_DELAY,
            retry: RetryPolicy::default(),
            running: AtomicBool::new(false),
            scheduled_restart: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_restart(mut self, restart: Arc<dyn Restart>, delay: Duration) -> Self {
        self.restart = Some(restart);
        self.restart_delay = delay;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_replacer(mut self, replacer: FileReplacer) -> Self {
        self.replacer = replacer;
        self
    }

    #[must_use]
    pub fn with_backup_retention(mut self, keep: Option<usize>) -> Self {
        self.backup_retention = keep;
        self
    }

    /// Run the whole pipeline for `package`, reporting each stage on
    /// `progress`. Failures are returned inside the result; nothing that was
    /// already replaced is rolled back.
    pub async fn run(
        &self,
        package: &UpdatePackage,
        progress: mpsc::Sender<UpdateProgress>,
    ) -> UpdateResult {
        if self.running.swap(true, Ordering::SeqCst) {
            let error = UpdateError::Logic("an update is already in progress".to_string());
            warn!("{error}");
            return UpdateResult::failure(&error);
        }
        let _running = RunningGuard(&self.running);

        let mut tracker = StepTracker::new(progress);
        match self.execute(package, &mut tracker).await {
            Ok(result) => result,
            Err(error) => {
                warn!("Update to {} failed: {error}", package.target_version);
                tracker.fail(&error).await;
                UpdateResult::failure(&error)
            }
        }
    }

    /// Wait for a scheduled restart to fire. Returns immediately when none is
    /// pending.
    pub async fn wait_for_restart(&self) {
        let handle = self
            .scheduled_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            warn!("Restart task failed: {error}");
        }
    }

    async fn execute(
        &self,
        package: &UpdatePackage,
        tracker: &mut StepTracker,
    ) -> Result<UpdateResult, UpdateError> {
        let lock = UpdateLock::acquire(&self.install_root)?;
        info!(
            "Updating {} to {} from {}",
            self.install_root.display(),
            package.target_version,
            package.download_url
        );

        std::fs::create_dir_all(&self.scratch_root)
            .map_err(|error| UpdateError::io("failed to create scratch root", error))?;
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.scratch_root)
            .map_err(|error| UpdateError::io("failed to create scratch directory", error))?;

        tracker
            .advance(
                UpdateStep::Downloading,
                format!("Downloading version {}", package.target_version),
            )
            .await?;
        let archive_path = scratch.path().join(archive_file_name(&package.download_url));
        let download = self.download_with_retry(package, &archive_path, tracker).await?;

        tracker
            .report(100, "Verifying downloaded archive".to_string())
            .await;
        let local_path = download.local_path.clone();
        let kind = run_blocking(move || validate(&local_path)).await?;
        debug!("Archive verified as {kind:?}, {} bytes", download.byte_size);

        tracker
            .advance(UpdateStep::Extracting, "Extracting update".to_string())
            .await?;
        let extract_dir = scratch.path().join("extracted");
        let extraction = self
            .extract_with_retry(&download.local_path, &extract_dir, tracker)
            .await?;

        tracker
            .advance(
                UpdateStep::BackingUp,
                "Backing up current installation".to_string(),
            )
            .await?;
        self.backup().await?;

        tracker
            .advance(UpdateStep::Replacing, "Installing new files".to_string())
            .await?;
        let release_root = extraction.extracted_root_path;
        let replacer = self.replacer.clone();
        let install_root = self.install_root.clone();
        let outcome =
            run_blocking(move || replacer.replace(&release_root, &install_root)).await?;

        tracker
            .advance(UpdateStep::CleaningUp, "Removing temporary files".to_string())
            .await?;
        let scratch_path = scratch.path().to_path_buf();
        if let Err(error) = scratch.close() {
            warn!(
                "Failed to remove scratch directory {}: {error}",
                scratch_path.display()
            );
        }
        drop(lock);

        let restart_scheduled = self.schedule_restart();
        let message = completion_message(&package.target_version, &outcome, restart_scheduled);
        tracker.advance(UpdateStep::Complete, message.clone()).await?;
        info!("{message}");

        Ok(UpdateResult {
            success: true,
            message,
            error: None,
            error_class: None,
            outcome: Some(outcome),
            restart_scheduled,
        })
    }

    async fn download_with_retry(
        &self,
        package: &UpdatePackage,
        archive_path: &Path,
        tracker: &StepTracker,
    ) -> Result<DownloadResult, UpdateError> {
        let sender = tracker.progress.clone();
        let on_progress = move |update: DownloadProgress| {
            let message = match update.total {
                Some(total) => format!("Downloaded {} of {total} bytes", update.downloaded),
                None => format!("Downloaded {} bytes", update.downloaded),
            };
            let _ = sender.try_send(UpdateProgress {
                step: UpdateStep::Downloading,
                progress: update.percent.unwrap_or(0),
                message,
            });
        };

        let attempts = self.retry.download_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match self
                .fetcher
                .download(&package.download_url, archive_path, &on_progress)
                .await
            {
                Ok(result) if result.succeeded => return Ok(result),
                Ok(_) => UpdateError::Logic("download reported failure".to_string()),
                Err(error) => UpdateError::from(error),
            };

            if attempt >= attempts || !error.is_retryable() {
                return Err(error);
            }
            warn!("Download attempt {attempt}/{attempts} failed: {error}");
            if let Err(error) = tokio::fs::remove_file(archive_path).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove partial download: {error}");
            }
            tracker
                .report(
                    0,
                    format!("Download failed, retrying ({}/{attempts})", attempt + 1),
                )
                .await;
            tokio::time::sleep(self.retry.download_delay).await;
            attempt += 1;
        }
    }

    async fn extract_with_retry(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
        tracker: &StepTracker,
    ) -> Result<ExtractionResult, UpdateError> {
        let attempts = self.retry.extract_attempts.max(1);
        let mut attempt = 1;
        loop {
            let archive = archive_path.to_path_buf();
            let target = extract_dir.to_path_buf();
            match run_blocking(move || extract(&archive, &target)).await {
                Ok(result) => {
                    tracker
                        .report(100, format!("Extracted {} entries", result.entry_count))
                        .await;
                    return Ok(result);
                }
                Err(error) if error.is_retryable() && attempt < attempts => {
                    warn!("Extraction attempt {attempt}/{attempts} failed: {error}");
                    tracker
                        .report(
                            0,
                            format!("Extraction failed, retrying ({}/{attempts})", attempt + 1),
                        )
                        .await;
                    tokio::time::sleep(self.retry.extract_delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn backup(&self) -> Result<(), UpdateError> {
        let backups = self.backups.clone();
        let install_root = self.install_root.clone();
        let retention = self.backup_retention;
        run_blocking(move || {
            let snapshot = backups.backup(&install_root)?;
            if let Some(keep) = retention
                && let Err(error) = backups.prune(keep.max(1))
            {
                warn!("Failed to prune old backups: {error}");
            }
            Ok::<_, UpdateError>(snapshot)
        })
        .await
        .map(|snapshot| {
            debug!("Backup stored at {}", snapshot.backup_path.display());
        })
    }

    fn schedule_restart(&self) -> bool {
        let Some(restart) = &self.restart else {
            return false;
        };
        let restart = Arc::clone(restart);
        let delay = self.restart_delay;
        info!("Restart scheduled in {}s", delay.as_secs());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = restart.relaunch() {
                warn!("Failed to restart after update: {error}");
            }
        });
        *self
            .scheduled_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }
}

async fn run_blocking<T, E, F>(task: F) -> Result<T, UpdateError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|error| UpdateError::Logic(format!("update task panicked: {error}")))?
        .map_err(Into::into)
}

fn archive_file_name(download_url: &str) -> String {
    url::Url::parse(download_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| {
            !name.is_empty()
                && !name.contains("..")
                && Path::new(name)
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        })
        .unwrap_or_else(|| "update.zip".to_string())
}

fn completion_message(version: &str, outcome: &ReplacementOutcome, restart: bool) -> String {
    let deferred = outcome.locked_files.len();
    match (deferred, restart) {
        (0, true) => format!("Updated to {version}. Restarting now."),
        (0, false) => format!("Updated to {version}."),
        (1, _) => format!("Updated to {version}. 1 file will finish updating after restart."),
        (n, _) => format!("Updated to {version}. {n} files will finish updating after restart."),
    }
}
