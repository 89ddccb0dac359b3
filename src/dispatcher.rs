//! Request dispatch for image and video background removal
//!
//! [`RequestDispatcher`] is constructed once at process start and shared by
//! every request handler. Image requests run synchronously under the
//! accelerator arbiter. Video requests are admitted, persisted and handed to
//! the [`VideoPipeline`] as tracked background tasks; callers poll
//! [`RequestDispatcher::status`] with the returned job id.

use crate::admission::AdmissionGate;
use crate::arbiter::ExclusiveResourceArbiter;
use crate::backends::video::{FrameCodec, VideoFormat};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::jobs::{JobId, JobState, JobStatusTable};
use crate::pipeline::{JobWorkspace, VideoPipeline};
use crate::retention::ArtifactSweeper;
use crate::segmentation::SegmenterRegistry;
use futures::future::join_all;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of a synchronous image request
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// PNG-encoded RGBA image
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Method that produced the result
    pub method: String,
    /// Wall-clock time spent on the request after admission
    pub elapsed: Duration,
}

/// Service liveness and load summary
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub methods: Vec<String>,
    pub accelerator_held: bool,
    pub active_model: Option<String>,
    pub leases_granted: u64,
    pub resource_faults: u64,
    pub jobs: usize,
    pub running_jobs: usize,
    pub blocked_clients: usize,
}

struct TrackedJob {
    handle: JoinHandle<JobState>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

type TaskMap = Arc<Mutex<HashMap<JobId, TrackedJob>>>;

/// Deregisters a job task however its future ends, panics included
struct TaskDeregistration {
    tasks: TaskMap,
    id: JobId,
    done: watch::Sender<bool>,
}

impl Drop for TaskDeregistration {
    fn drop(&mut self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        let _ = self.done.send(true);
    }
}

/// Entry point for background removal requests
pub struct RequestDispatcher {
    config: ServiceConfig,
    admission: Arc<AdmissionGate>,
    arbiter: ExclusiveResourceArbiter,
    registry: SegmenterRegistry,
    jobs: Arc<JobStatusTable>,
    pipeline: Arc<VideoPipeline>,
    tasks: TaskMap,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("methods", &self.registry.methods())
            .field("arbiter", &self.arbiter)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// Build a dispatcher from validated configuration
    pub fn new(
        config: ServiceConfig,
        registry: SegmenterRegistry,
        codec: Arc<dyn FrameCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(AdmissionGate::new(&config.admission));
        Ok(Self::assemble(config, admission, registry, codec))
    }

    /// Build a dispatcher around an existing admission gate
    pub fn with_admission(
        config: ServiceConfig,
        admission: Arc<AdmissionGate>,
        registry: SegmenterRegistry,
        codec: Arc<dyn FrameCodec>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, admission, registry, codec))
    }

    fn assemble(
        config: ServiceConfig,
        admission: Arc<AdmissionGate>,
        registry: SegmenterRegistry,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        let arbiter = ExclusiveResourceArbiter::new(&config.arbiter);
        let pipeline = Arc::new(VideoPipeline::new(
            arbiter.clone(),
            codec,
            &config.video,
            config.storage.output_dir.clone(),
        ));

        Self {
            config,
            admission,
            arbiter,
            registry,
            jobs: Arc::new(JobStatusTable::new()),
            pipeline,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            maintenance: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionGate> {
        &self.admission
    }

    #[must_use]
    pub fn arbiter(&self) -> &ExclusiveResourceArbiter {
        &self.arbiter
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobStatusTable> {
        &self.jobs
    }

    /// Registered method names
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.registry.methods()
    }

    /// Remove the background of one image
    ///
    /// # Errors
    /// - `AdmissionRejected` when the client is blocked or over its limit
    /// - `ValidationFailed` for unknown methods, empty, oversized or undecodable uploads
    /// - `InferenceFailed` / `ResourceFault` from the model or the accelerator
    /// - `Cancelled` if `cancel` fires while waiting for the accelerator
    #[instrument(skip(self, bytes, cancel), fields(bytes = bytes.len()))]
    pub async fn remove_background(
        &self,
        client: &str,
        method: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse> {
        self.admission.admit(client)?;
        let model = self.registry.get(method)?;
        self.check_upload_size(bytes.len())?;

        let start = Instant::now();
        let image = tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| ServiceError::internal(format!("image decode task failed: {e}")))??;

        let rgba = self
            .arbiter
            .run_exclusive(model, cancel, move |model| model.segment(&image))
            .await?;
        let (width, height) = rgba.dimensions();

        let png = tokio::task::spawn_blocking(move || encode_png(DynamicImage::ImageRgba8(rgba)))
            .await
            .map_err(|e| ServiceError::internal(format!("image encode task failed: {e}")))??;

        let elapsed = start.elapsed();
        info!(
            method,
            width,
            height,
            elapsed_ms = elapsed.as_millis() as u64,
            "Image background removed"
        );
        Ok(ImageResponse {
            png,
            width,
            height,
            method: method.to_string(),
            elapsed,
        })
    }

    /// Accept a video for background removal and start it in the background
    ///
    /// Returns as soon as the upload is persisted; failures after that point
    /// are recorded in the job table.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn submit_video(
        &self,
        client: &str,
        method: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<JobId> {
        self.admission.admit(client)?;
        let model = self.registry.get(method)?;
        self.check_upload_size(bytes.len())?;
        let format = VideoFormat::from_file_name(file_name).ok_or_else(|| {
            ServiceError::validation(format!(
                "Unsupported video file '{file_name}'. Expected mp4, mov, avi, mkv or webm"
            ))
        })?;

        let (id, writer) = self.jobs.create();
        let workspace = match self.prepare_workspace(id, format, &bytes).await {
            Ok(workspace) => workspace,
            Err(e) => {
                writer.discard();
                return Err(e);
            },
        };

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let pipeline = Arc::clone(&self.pipeline);
        let tasks = Arc::clone(&self.tasks);
        let job_cancel = cancel.clone();

        // The map lock is held across spawn so the task cannot deregister first
        let mut tracked = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let _deregister = TaskDeregistration {
                tasks,
                id,
                done: done_tx,
            };
            pipeline.run(writer, workspace, model, job_cancel).await
        });
        tracked.insert(
            id,
            TrackedJob {
                handle,
                cancel,
                done: done_rx,
            },
        );
        drop(tracked);

        info!(job_id = %id, method, format = format.extension(), "Video job accepted");
        Ok(id)
    }

    async fn prepare_workspace(
        &self,
        id: JobId,
        format: VideoFormat,
        bytes: &[u8],
    ) -> Result<JobWorkspace> {
        let workspace = JobWorkspace::create(&self.config.storage.scratch_dir, id, format.extension())?;
        workspace.write_input(bytes).await?;
        debug!(job_id = %id, path = %workspace.path().display(), "Upload persisted");
        Ok(workspace)
    }

    fn check_upload_size(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(ServiceError::validation("No file uploaded"));
        }
        if len as u64 > self.config.max_upload_bytes {
            return Err(ServiceError::validation(format!(
                "Upload of {len} bytes exceeds the limit of {} bytes",
                self.config.max_upload_bytes
            )));
        }
        Ok(())
    }

    /// Latest state of a video job
    pub fn status(&self, id: JobId) -> Result<JobState> {
        self.jobs.get(id)
    }

    /// Path of a completed job's artifact
    ///
    /// # Errors
    /// - `JobNotFound` for unknown jobs and swept artifacts
    /// - `JobNotReady` while the job is running or when it failed
    pub fn fetch_artifact(&self, id: JobId) -> Result<PathBuf> {
        match self.jobs.get(id)? {
            JobState::Completed { output } if output.is_file() => Ok(output),
            JobState::Completed { .. } => Err(ServiceError::JobNotFound(format!(
                "{id} (artifact has expired)"
            ))),
            JobState::Failed { reason } => {
                Err(ServiceError::JobNotReady(format!("{id} failed: {reason}")))
            },
            other => Err(ServiceError::JobNotReady(format!("{id} is {}", other.label()))),
        }
    }

    /// Request cancellation of a running job
    ///
    /// Returns false when the job is unknown or already finished.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                info!(job_id = %id, "Video job cancellation requested");
                true
            },
            None => false,
        }
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait_for_job(&self, id: JobId) -> Result<JobState> {
        let done = {
            let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.get(&id).map(|job| job.done.clone())
        };
        if let Some(mut done) = done {
            // A dropped sender means the task ended abnormally; the table still has its state
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.jobs.get(id)
    }

    /// Number of video jobs still running
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Start the admission and artifact sweepers
    pub fn spawn_maintenance(&self) {
        let admission = self
            .admission
            .spawn_sweeper(self.config.admission.sweep_interval, self.shutdown.child_token());
        let sweeper = Arc::new(ArtifactSweeper::new(
            self.config.storage.output_dir.clone(),
            self.config.video.artifact_retention,
            Arc::clone(&self.jobs),
        ));
        let artifacts = sweeper.spawn(
            self.config.video.artifact_sweep_interval,
            self.shutdown.child_token(),
        );

        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([admission, artifacts]);
        debug!("Maintenance tasks started");
    }

    /// Cancel every running job and maintenance task and wait for them
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let (ids, handles): (Vec<_>, Vec<_>) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(id, job)| (id, job.handle))
            .unzip();
        for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                warn!(job_id = %id, error = %e, "Video job task ended abnormally");
            }
        }

        let maintenance: Vec<_> = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Dispatcher shut down");
    }

    /// Liveness summary
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            methods: self.registry.methods(),
            accelerator_held: self.arbiter.is_held(),
            active_model: self.arbiter.active_model(),
            leases_granted: self.arbiter.leases_granted(),
            resource_faults: self.arbiter.faults(),
            jobs: self.jobs.len(),
            running_jobs: self.running_jobs(),
            blocked_clients: self.admission.blocked_clients().len(),
        }
    }
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| ServiceError::validation(format!("Uploaded file is not a readable image: {e}")))
}

fn encode_png(image: DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
