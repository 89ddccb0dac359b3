//! Multi-stage video background removal
//!
//! A job moves through extract → batch-process → encode. Frames are
//! transformed in place on disk, in batches, under a single accelerator lease.
//! Every exit path removes the job's scratch directory and leaves the job in a
//! terminal state.

use crate::arbiter::{ExclusiveResourceArbiter, ResourceLease};
use crate::backends::video::{EncodeOptions, FrameCodec};
use crate::config::VideoConfig;
use crate::error::{Result, ServiceError};
use crate::jobs::{JobId, JobState, JobWriter};
use crate::segmentation::Segmenter;
use image::ImageFormat;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scratch directory of one job: the upload and its extracted frames
///
/// Backed by a [`TempDir`], so the directory disappears when the workspace is
/// dropped, whichever way the job ended.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
    input: PathBuf,
    frames: PathBuf,
}

impl JobWorkspace {
    /// Create `job-<id>-XXXX` under `scratch_root`
    pub fn create(scratch_root: &Path, id: JobId, input_extension: &str) -> Result<Self> {
        std::fs::create_dir_all(scratch_root)
            .map_err(|e| ServiceError::file_io_error("create scratch root", scratch_root, &e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{id}-"))
            .tempdir_in(scratch_root)
            .map_err(|e| ServiceError::file_io_error("create job workspace in", scratch_root, &e))?;

        let input = dir.path().join(format!("input.{input_extension}"));
        let frames = dir.path().join("frames");
        Ok(Self { dir, input, frames })
    }

    /// Persist the uploaded video
    pub async fn write_input(&self, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(&self.input, bytes)
            .await
            .map_err(|e| ServiceError::file_io_error("write upload to", &self.input, &e))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn input_path(&self) -> &Path {
        &self.input
    }

    #[must_use]
    pub fn frames_dir(&self) -> &Path {
        &self.frames
    }

    fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove job workspace");
        }
    }
}

/// Runs video jobs end to end
pub struct VideoPipeline {
    arbiter: ExclusiveResourceArbiter,
    codec: Arc<dyn FrameCodec>,
    batch_size: usize,
    encode: EncodeOptions,
    output_dir: PathBuf,
}

impl std::fmt::Debug for VideoPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoPipeline")
            .field("batch_size", &self.batch_size)
            .field("encode", &self.encode)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl VideoPipeline {
    #[must_use]
    pub fn new(
        arbiter: ExclusiveResourceArbiter,
        codec: Arc<dyn FrameCodec>,
        config: &VideoConfig,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            arbiter,
            codec,
            batch_size: config.batch_size.max(1),
            encode: EncodeOptions {
                framerate: config.framerate,
                ..EncodeOptions::default()
            },
            output_dir,
        }
    }

    /// Where the artifact of job `id` is written
    #[must_use]
    pub fn output_path(&self, id: JobId) -> PathBuf {
        self.output_dir
            .join(format!("{id}.{}", self.encode.codec.container_extension()))
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run one job to completion and return its terminal state
    ///
    /// Failures are recorded in the job table rather than returned.
    pub async fn run(
        &self,
        mut writer: JobWriter,
        workspace: JobWorkspace,
        model: Arc<dyn Segmenter>,
        cancel: CancellationToken,
    ) -> JobState {
        let id = writer.id();
        let start = Instant::now();
        info!(job_id = %id, model = %model.name(), "Video job started");

        let outcome = self.execute(&mut writer, &workspace, model, &cancel).await;
        workspace.cleanup();

        let state = match outcome {
            Ok(output) => {
                info!(
                    job_id = %id,
                    output = %output.display(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Video job completed"
                );
                JobState::Completed { output }
            },
            Err(e) => {
                let reason = match e {
                    ServiceError::Cancelled(_) => "cancelled".to_string(),
                    other => other.to_string(),
                };
                warn!(job_id = %id, reason = %reason, "Video job failed");
                self.discard_output(id).await;
                JobState::Failed { reason }
            },
        };

        if let Err(e) = writer.update(state.clone()) {
            warn!(job_id = %id, error = %e, "Could not record final job state");
        }
        state
    }

    async fn execute(
        &self,
        writer: &mut JobWriter,
        workspace: &JobWorkspace,
        model: Arc<dyn Segmenter>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let id = writer.id();

        writer.update(JobState::Extracting)?;
        let expected = until_cancelled(cancel, self.codec.probe_frame_count(workspace.input_path())).await?;
        if expected == 0 {
            return Err(ServiceError::validation("video contains no frames"));
        }
        let frames = until_cancelled(
            cancel,
            self.codec
                .extract_frames(workspace.input_path(), workspace.frames_dir()),
        )
        .await?;
        if frames.is_empty() {
            return Err(ServiceError::validation("no frames could be extracted from the video"));
        }
        if frames.len() as u64 != expected {
            debug!(job_id = %id, expected, extracted = frames.len(), "Extracted frame count differs from ffprobe");
        }

        writer.update(JobState::Processing { progress: 0 })?;
        self.process_frames(writer, &frames, model, cancel).await?;

        writer.update(JobState::Encoding)?;
        let output = self.output_path(id);
        until_cancelled(
            cancel,
            self.codec
                .encode_frames(workspace.frames_dir(), &output, &self.encode),
        )
        .await
    }

    async fn process_frames(
        &self,
        writer: &mut JobWriter,
        frames: &[PathBuf],
        model: Arc<dyn Segmenter>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut lease = if model.needs_resource() {
            Some(self.arbiter.acquire(Arc::clone(&model), cancel).await?)
        } else {
            None
        };

        let outcome = self
            .transform_batches(writer, frames, &model, &mut lease, cancel)
            .await;
        let released = match lease {
            Some(lease) => lease.release().await,
            None => Ok(()),
        };

        outcome?;
        released
    }

    async fn transform_batches(
        &self,
        writer: &mut JobWriter,
        frames: &[PathBuf],
        model: &Arc<dyn Segmenter>,
        lease: &mut Option<ResourceLease>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = frames.len();
        let mut done = 0;

        for batch in frames.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(ServiceError::cancelled("job cancelled between batches"));
            }
            if let Some(lease) = lease.as_ref() {
                lease.checkpoint()?;
            }

            // The blocking batch owns the lease until it returns, even if
            // this job is dropped while waiting on it
            let batch = batch.to_vec();
            let worker = Arc::clone(model);
            let held = lease.take();
            let (held, transformed) = tokio::task::spawn_blocking(move || {
                let transformed = transform_batch(worker.as_ref(), &batch);
                (held, transformed)
            })
            .await
            .map_err(|e| ServiceError::internal(format!("frame batch task failed: {e}")))?;
            *lease = held;
            done += transformed?;

            if let Some(lease) = lease.as_ref() {
                lease.checkpoint()?;
                lease.touch();
            }
            let progress = percent(done, total);
            writer.update(JobState::Processing { progress })?;
            debug!(job_id = %writer.id(), done, total, progress, "Frame batch processed");

            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn discard_output(&self, id: JobId) {
        let output = self.output_path(id);
        match tokio::fs::remove_file(&output).await {
            Ok(()) => debug!(job_id = %id, "Removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(job_id = %id, error = %e, "Failed to remove partial output"),
        }
    }
}

/// Segment every frame of `batch`, overwriting each file with its RGBA result
fn transform_batch(model: &dyn Segmenter, batch: &[PathBuf]) -> Result<usize> {
    for path in batch {
        let frame = image::open(path)?;
        let transformed = model.segment(&frame).map_err(|e| {
            ServiceError::inference(format!(
                "frame {}: {e}",
                path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
            ))
        })?;
        transformed.save_with_format(path, ImageFormat::Png)?;
    }
    Ok(batch.len())
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.min(total) * 100 / total).unwrap_or(100)
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ServiceError::cancelled("job cancelled")),
        result = work => result,
    }
}
