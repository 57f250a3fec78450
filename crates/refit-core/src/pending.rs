use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::queue::{PendingQueue, QueueError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingReport {
    pub processed: usize,
    pub failed: usize,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug, Error)]
pub enum PendingError {
    #[error("discarded malformed pending update queue: {0}")]
    MalformedQueue(#[source] QueueError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Finish replacements deferred by the previous run.
///
/// Must run before the application initializes anything that could map the
/// files being replaced. Every queued entry gets exactly one more attempt;
/// afterwards the queue file and staging area are removed whatever the
/// outcome.
///
/// # Errors
/// Returns [`PendingError::MalformedQueue`] when the queue file does not
/// parse (the file is removed anyway), or an error when the queue cannot be
/// read or removed.
pub fn process_pending_updates(install_root: &Path) -> Result<PendingReport, PendingError> {
    let queue = PendingQueue::new(install_root);
    if !queue.exists() {
        return Ok(PendingReport::default());
    }

    let entries = match queue.load() {
        Ok(entries) => entries,
        Err(error @ QueueError::Malformed { .. }) => {
            warn!("{error}");
            queue.clear()?;
            return Err(PendingError::MalformedQueue(error));
        }
        Err(error) => return Err(error.into()),
    };

    info!("Applying {} pending file updates", entries.len());
    let mut report = PendingReport::default();
    for entry in &entries {
        match apply_entry(&entry.source_path, &entry.destination_path) {
            Ok(()) => report.processed += 1,
            Err(error) => {
                warn!(
                    "Pending update for {} failed: {error}",
                    entry.relative_path.display()
                );
                report.failed += 1;
                report
                    .failures
                    .push((entry.relative_path.clone(), error.to_string()));
            }
        }
    }

    queue.clear()?;
    info!(
        "Pending updates finished: {} applied, {} failed",
        report.processed, report.failed
    );
    Ok(report)
}

fn apply_entry(source: &Path, destination: &Path) -> std::io::Result<()> {
    if !source.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("staged file {} is missing", source.display()),
        ));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, destination).map(|_| ())
}
