use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use refit_core::{
    BackupManager, Fetcher, ManifestCache, RelaunchProcess, ReleaseChecker, ReleaseInfo,
    StartupReport, UpdateOrchestrator, UpdatePackage, UpdateProgress, UpdateStep,
    run_startup_tasks,
};
use refit_platform::AppPaths;
use tokio::sync::mpsc;

use crate::cli::{ApplyArgs, BackupsCommand};
use crate::error::CliError;
use crate::settings::UpdaterSettings;

const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Context {
    pub paths: AppPaths,
    pub settings: UpdaterSettings,
    pub install_root: PathBuf,
}

impl Context {
    fn backups(&self) -> BackupManager {
        BackupManager::new(self.paths.backup_dir())
    }

    fn release_checker(&self) -> Result<ReleaseChecker, CliError> {
        let manifest_url = self.settings.manifest_url.clone().ok_or_else(|| {
            CliError::Usage("no manifest_url configured in settings".to_string())
        })?;
        let cache = Arc::new(ManifestCache::new(self.settings.manifest_cache_ttl()));
        Ok(ReleaseChecker::new(manifest_url, cache)?)
    }
}

pub fn run_startup(context: &Context) -> Result<StartupReport, CliError> {
    let report = run_startup_tasks(&context.install_root, &context.paths.scratch_dir())?;
    if report.pending.processed > 0 || report.pending.failed > 0 {
        info!(
            "Finished deferred updates: {} applied, {} failed",
            report.pending.processed, report.pending.failed
        );
    }
    Ok(report)
}

pub fn print_startup_report(report: &StartupReport) {
    if report.skipped {
        println!("Another update is in progress; nothing to do.");
        return;
    }
    println!(
        "Deferred updates: {} applied, {} failed",
        report.pending.processed, report.pending.failed
    );
    for (path, reason) in &report.pending.failures {
        println!("  {}: {reason}", path.display());
    }
    if report.scratch_removed > 0 {
        println!("Removed {} stale scratch directories", report.scratch_removed);
    }
}

pub async fn run_check(context: &Context) -> Result<(), CliError> {
    let checker = context.release_checker()?;
    match checker.check(CURRENT_VERSION).await? {
        Some(release) => {
            println!(
                "Update available: {CURRENT_VERSION} -> {}",
                release.normalized_version()
            );
            if let Some(notes) = &release.notes {
                println!("\n{notes}");
            }
        }
        None => println!("Up to date ({CURRENT_VERSION})"),
    }
    Ok(())
}

pub async fn run_apply(context: &Context, args: &ApplyArgs) -> Result<(), CliError> {
    let Some(package) = resolve_package(context, args).await? else {
        println!("Up to date ({CURRENT_VERSION})");
        return Ok(());
    };

    let fetcher = Arc::new(Fetcher::new(context.settings.download_timeout())?);
    let mut orchestrator = UpdateOrchestrator::new(
        &context.install_root,
        context.paths.scratch_dir(),
        context.paths.backup_dir(),
        fetcher,
    )
    .with_retry_policy(context.settings.retry_policy())
    .with_backup_retention(context.settings.backup_retention);

    if !args.no_restart {
        let relaunch = RelaunchProcess::with_args([
            "--install-root".into(),
            context.install_root.clone().into_os_string(),
            "pending".into(),
        ]);
        orchestrator =
            orchestrator.with_restart(Arc::new(relaunch), context.settings.restart_delay());
    }

    let (sender, receiver) = mpsc::channel(64);
    let printer = tokio::spawn(print_progress(receiver));
    let result = orchestrator.run(&package, sender).await;
    let _ = printer.await;

    if !result.success {
        return Err(CliError::UpdateFailed {
            message: result.message,
            class: result.error_class,
        });
    }

    println!("{}", result.message);
    if let Some(outcome) = &result.outcome {
        for skipped in &outcome.skipped_files {
            println!("  skipped {}", skipped.display());
        }
    }
    orchestrator.wait_for_restart().await;
    Ok(())
}

async fn resolve_package(
    context: &Context,
    args: &ApplyArgs,
) -> Result<Option<UpdatePackage>, CliError> {
    if let Some(url) = &args.url {
        let version = args.version.clone().unwrap_or_else(|| "unknown".to_string());
        return Ok(Some(UpdatePackage::new(url.clone(), version)));
    }

    let template = context.settings.release_url_template.as_deref().ok_or_else(|| {
        CliError::Usage("pass --url or configure release_url_template in settings".to_string())
    })?;

    let release = match &args.version {
        Some(version) => ReleaseInfo {
            version: version.clone(),
            notes: None,
            published_at: None,
        },
        None => match context.release_checker()?.check(CURRENT_VERSION).await? {
            Some(release) => release,
            None => return Ok(None),
        },
    };
    Ok(Some(UpdatePackage::for_release(template, &release)))
}

async fn print_progress(mut receiver: mpsc::Receiver<UpdateProgress>) {
    let mut last: Option<(UpdateStep, u8)> = None;
    while let Some(event) = receiver.recv().await {
        let bucket = event.progress / 10;
        if last == Some((event.step, bucket)) {
            continue;
        }
        last = Some((event.step, bucket));
        println!("[{:>11}] {:>3}% {}", event.step, event.progress, event.message);
    }
}

pub fn run_backups(context: &Context, command: &BackupsCommand) -> Result<(), CliError> {
    let backups = context.backups();
    match command {
        BackupsCommand::List => {
            let snapshots = backups.list_snapshots()?;
            if snapshots.is_empty() {
                println!("No backups in {}", backups.backup_root().display());
            }
            for snapshot in snapshots {
                if let Some(name) = snapshot.file_name() {
                    println!("{}", name.to_string_lossy());
                }
            }
        }
        BackupsCommand::Prune { keep } => {
            let removed = backups.prune(*keep)?;
            println!("Removed {} backups", removed.len());
        }
        BackupsCommand::Restore { name } => {
            let snapshot = backups.snapshot_named(name)?;
            let restored = backups.restore(&snapshot, &context.install_root)?;
            println!(
                "Restored {restored} files into {}",
                context.install_root.display()
            );
        }
    }
    Ok(())
}
