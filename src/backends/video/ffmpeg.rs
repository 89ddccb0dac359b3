//! FFmpeg subprocess integration
//!
//! Each operation is one `ffmpeg`/`ffprobe` invocation whose exit status and
//! stderr decide success. Children are spawned with `kill_on_drop`, so
//! dropping an in-flight call (timeout or job cancellation) kills the process.

use crate::backends::video::{list_frames, EncodeOptions, FrameCodec, FRAME_PATTERN};
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Diagnostic output kept from a failing tool, from the end of stderr
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// FFmpeg-backed frame codec
#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Option<Duration>,
}

impl Default for FfmpegCodec {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FfmpegCodec {
    /// Use `ffmpeg`/`ffprobe` from `PATH`
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout,
        }
    }

    /// Use explicit executable paths
    #[must_use]
    pub fn with_binaries<P: Into<PathBuf>, Q: Into<PathBuf>>(mut self, ffmpeg: P, ffprobe: Q) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    /// Whether the ffmpeg executable can be started
    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    async fn run(&self, tool: &str, mut command: Command) -> Result<Output> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ServiceError::ExternalToolFailed {
            tool: tool.to_string(),
            status: "failed to start".to_string(),
            diagnostics: e.to_string(),
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ServiceError::timeout(format!("{tool} did not finish within {limit:?}")))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ServiceError::file_io_error(&format!("wait for {tool}"), tool, &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::external_tool(
                tool,
                &output.status,
                tail(&stderr, MAX_DIAGNOSTIC_CHARS),
            ));
        }
        Ok(output)
    }

    fn ffmpeg_command(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]);
        command
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or(text, |(offset, _)| text.get(offset..).unwrap_or(text))
}

fn parse_frame_count(stdout: &str) -> Result<u64> {
    stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(','))
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u64>().ok())
        .ok_or_else(|| ServiceError::ExternalToolFailed {
            tool: "ffprobe".to_string(),
            status: "exit code 0".to_string(),
            diagnostics: format!("unexpected frame count output: {:?}", stdout.trim()),
        })
}

#[async_trait]
impl FrameCodec for FfmpegCodec {
    #[instrument(skip_all, fields(input = %input.display()))]
    async fn probe_frame_count(&self, input: &Path) -> Result<u64> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-count_packets",
                "-show_entries",
                "stream=nb_read_packets",
                "-of",
                "csv=p=0",
            ])
            .arg(input);

        let output = self.run("ffprobe", command).await?;
        let count = parse_frame_count(&String::from_utf8_lossy(&output.stdout))?;
        debug!(frames = count, "Probed video frame count");
        Ok(count)
    }

    #[instrument(skip_all, fields(input = %input.display(), out_dir = %out_dir.display()))]
    async fn extract_frames(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| ServiceError::file_io_error("create frame directory", out_dir, &e))?;

        let mut command = self.ffmpeg_command();
        command.arg("-i").arg(input).arg(out_dir.join(FRAME_PATTERN));
        self.run("ffmpeg", command).await?;

        let frames = list_frames(out_dir)?;
        debug!(frames = frames.len(), "Extracted frames");
        Ok(frames)
    }

    #[instrument(skip_all, fields(frame_dir = %frame_dir.display(), output = %output.display()))]
    async fn encode_frames(
        &self,
        frame_dir: &Path,
        output: &Path,
        options: &EncodeOptions,
    ) -> Result<PathBuf> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::file_io_error("create output directory", parent, &e))?;
        }

        let mut command = self.ffmpeg_command();
        command
            .arg("-framerate")
            .arg(options.framerate.to_string())
            .arg("-i")
            .arg(frame_dir.join(FRAME_PATTERN))
            .args(options.codec.ffmpeg_args())
            .arg(output);
        self.run("ffmpeg", command).await?;

        debug!(codec = %options.codec, fps = options.framerate, "Encoded frames");
        Ok(output.to_path_buf())
    }
}
