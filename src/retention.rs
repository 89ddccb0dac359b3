//! Expiry of finished video artifacts

use crate::jobs::{JobId, JobStatusTable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deletes output artifacts older than the retention window
///
/// An artifact named after a job id takes the job's table entry with it, so a
/// later fetch reports the job as unknown rather than pointing at a missing
/// file. Failed jobs older than the window are forgotten too.
#[derive(Debug)]
pub struct ArtifactSweeper {
    output_dir: PathBuf,
    retention: Duration,
    jobs: Arc<JobStatusTable>,
}

impl ArtifactSweeper {
    #[must_use]
    pub fn new(output_dir: PathBuf, retention: Duration, jobs: Arc<JobStatusTable>) -> Self {
        Self {
            output_dir,
            retention,
            jobs,
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Remove expired artifacts and return how many were deleted
    pub async fn sweep(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = %self.output_dir.display(), error = %e, "Cannot read output directory");
                return 0;
            },
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Output directory listing interrupted");
                    break;
                },
            };
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.retention {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Expired artifact removed");
                    if let Some(id) = job_id_of(&path) {
                        self.jobs.remove(id);
                    }
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove expired artifact"),
            }
        }

        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let pruned = self.jobs.prune_failed_before(cutoff);

        if removed > 0 || pruned > 0 {
            info!(artifacts = removed, failed_jobs = pruned, "Artifact sweep finished");
        }
        removed
    }

    /// Run [`ArtifactSweeper::sweep`] every `interval` until `cancel` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("Artifact sweeper stopped");
        })
    }
}

fn job_id_of(path: &Path) -> Option<JobId> {
    path.file_stem()?.to_str()?.parse().ok()
}
