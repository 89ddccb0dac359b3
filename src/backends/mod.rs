//! Backend implementations for the external capabilities
//!
//! - Tract segmenter (pure Rust ONNX inference)
//! - Video frame codec (FFmpeg subprocesses)

#[cfg(feature = "tract")]
pub mod tract;

pub mod video;

#[cfg(feature = "tract")]
pub use self::tract::{Preprocessing, TractSegmenter};

pub use self::video::{FfmpegCodec, FrameCodec, VideoFormat};
