//! Video frame codec backend
//!
//! The pipeline never decodes video itself. It asks a [`FrameCodec`] to probe
//! an upload, explode it into numbered still frames on disk, and later pack the
//! transformed frames back into a container. [`FfmpegCodec`] does this with the
//! `ffmpeg`/`ffprobe` executables.

pub mod codec;
pub mod ffmpeg;

pub use codec::*;
pub use ffmpeg::*;

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// printf-style pattern handed to ffmpeg for frame files
pub const FRAME_PATTERN: &str = "frame_%06d.png";

/// File name of the 1-based frame `index`
#[must_use]
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:06}.png")
}

/// Frame files in `dir`, in sequence order
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("frame_*.png");
    let pattern = pattern.to_str().ok_or_else(|| {
        ServiceError::internal(format!("frame directory is not valid UTF-8: {}", dir.display()))
    })?;

    let mut frames = glob::glob(pattern)
        .map_err(|e| ServiceError::internal(format!("invalid frame pattern: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServiceError::file_io_error("list frames in", dir, e.error()))?;
    // Zero-padded names sort in frame order
    frames.sort();
    Ok(frames)
}

/// Video container formats accepted as uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    /// MP4 format (H.264/H.265)
    Mp4,
    /// AVI format
    Avi,
    /// MOV format (QuickTime)
    Mov,
    /// MKV format (Matroska)
    Mkv,
    /// WebM format
    WebM,
}

impl VideoFormat {
    /// Get file extension for the video format
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Avi => "avi",
            Self::Mov => "mov",
            Self::Mkv => "mkv",
            Self::WebM => "webm",
        }
    }

    /// Get MIME type for the video format
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Avi => "video/x-msvideo",
            Self::Mov => "video/quicktime",
            Self::Mkv => "video/x-matroska",
            Self::WebM => "video/webm",
        }
    }

    /// Detect format from file extension
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp4" | "m4v" => Some(Self::Mp4),
            "avi" => Some(Self::Avi),
            "mov" => Some(Self::Mov),
            "mkv" => Some(Self::Mkv),
            "webm" => Some(Self::WebM),
            _ => None,
        }
    }

    /// Detect format from an uploaded file name
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

/// Parameters for re-encoding transformed frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Output frame rate
    pub framerate: u32,
    /// Alpha-preserving codec
    pub codec: AlphaCodec,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            framerate: 24,
            codec: AlphaCodec::default(),
        }
    }
}

/// External tool that converts between video files and frame sequences
#[async_trait]
pub trait FrameCodec: Send + Sync {
    /// Number of video frames in `input`
    async fn probe_frame_count(&self, input: &Path) -> Result<u64>;

    /// Write every frame of `input` into `out_dir` using [`FRAME_PATTERN`]
    ///
    /// Returns the frame files in order.
    async fn extract_frames(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Encode the frame sequence in `frame_dir` into `output`
    async fn encode_frames(
        &self,
        frame_dir: &Path,
        output: &Path,
        options: &EncodeOptions,
    ) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_format_detection() {
        assert_eq!(VideoFormat::from_file_name("clip.MP4"), Some(VideoFormat::Mp4));
        assert_eq!(VideoFormat::from_file_name("a.b.webm"), Some(VideoFormat::WebM));
        assert_eq!(VideoFormat::from_file_name("photo.png"), None);
        assert_eq!(VideoFormat::from_file_name("noext"), None);
        assert_eq!(VideoFormat::Mov.mime_type(), "video/quicktime");
    }

    #[test]
    fn test_frame_listing_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10, 2, 1] {
            std::fs::write(dir.path().join(frame_file_name(index)), b"x").unwrap();
        }
        std::fs::write(dir.path().join("input.mp4"), b"x").unwrap();

        let frames = list_frames(dir.path()).unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["frame_000001.png", "frame_000002.png", "frame_000010.png"]);
    }
}
