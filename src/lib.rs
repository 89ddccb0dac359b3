#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # Background Removal Service Core
//!
//! Request admission and accelerator arbitration for an image and video
//! background removal service.
//!
//! The crate decides per request whether a client may proceed, serializes
//! access to a single accelerator context shared by every model, and runs
//! video jobs as background pipelines whose progress is polled out of band.
//!
//! ## Components
//!
//! - [`AdmissionGate`]: per-client daily limit, abuse blocking and counter sweeping
//! - [`ExclusiveResourceArbiter`]: one FIFO token guarding the accelerator, handed out as [`ResourceLease`]s
//! - [`JobStatusTable`]: job id → latest [`JobState`], with a single [`JobWriter`] per job
//! - [`VideoPipeline`]: extract → batch-process → encode, with cleanup on every exit path
//! - [`RequestDispatcher`]: composes the above behind image and video entry points
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgremove_service::{
//!     FfmpegCodec, PassthroughSegmenter, RequestDispatcher, SegmenterRegistry, ServiceConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::from_env()?;
//! let mut registry = SegmenterRegistry::new();
//! registry.register(Arc::new(PassthroughSegmenter::new()));
//! let codec = Arc::new(FfmpegCodec::new(config.video.tool_timeout));
//!
//! let dispatcher = RequestDispatcher::new(config, registry, codec)?;
//! dispatcher.spawn_maintenance();
//!
//! let video = tokio::fs::read("clip.mp4").await?;
//! let job = dispatcher
//!     .submit_video("203.0.113.7", "passthrough", "clip.mp4", video)
//!     .await?;
//! let state = dispatcher.wait_for_job(job).await?;
//! println!("{job}: {state:?}");
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): pure Rust ONNX segmenter
//! - `cli` (default): command-line front end and tracing subscriber setup
//! - `tracing-json`: JSON log output for the CLI
//! - `tracing-files`: rolling log files for the CLI

pub mod admission;
pub mod arbiter;
pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod retention;
pub mod segmentation;
#[cfg(feature = "cli")]
pub mod tracing_config;

// Public API exports
pub use admission::{AdmissionDecision, AdmissionGate, Clock, SystemClock};
pub use arbiter::{ExclusiveResourceArbiter, ResourceLease};
pub use backends::video::{AlphaCodec, EncodeOptions, FfmpegCodec, FrameCodec, VideoFormat};
#[cfg(feature = "tract")]
pub use backends::{Preprocessing, TractSegmenter};
pub use config::{
    AdmissionConfig, ArbiterConfig, ServiceConfig, ServiceConfigBuilder, StorageConfig,
    VideoConfig,
};
pub use dispatcher::{HealthReport, ImageResponse, RequestDispatcher};
pub use error::{AdmissionRejection, Result, ServiceError};
pub use jobs::{JobEvent, JobId, JobRecord, JobState, JobStatusTable, JobWriter};
pub use pipeline::{JobWorkspace, VideoPipeline};
pub use retention::ArtifactSweeper;
pub use segmentation::{apply_mask, ModelMethod, PassthroughSegmenter, Segmenter, SegmenterRegistry};
