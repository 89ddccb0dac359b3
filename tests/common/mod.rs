//! Shared fixtures for dispatcher integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bgremove_service::backends::video::{frame_file_name, list_frames};
use bgremove_service::{
    EncodeOptions, FrameCodec, Result, Segmenter, SegmenterRegistry, ServiceConfig, ServiceError,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Codec that fakes ffmpeg with PNG frames written straight to disk
#[derive(Default)]
pub struct ScriptedCodec {
    pub frames: usize,
    /// When set, extraction waits until notified
    pub extract_gate: Option<Arc<Notify>>,
    pub fail_encode: bool,
}

impl ScriptedCodec {
    pub fn with_frames(frames: usize) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }
}

#[async_trait]
impl FrameCodec for ScriptedCodec {
    async fn probe_frame_count(&self, _input: &Path) -> Result<u64> {
        Ok(self.frames as u64)
    }

    async fn extract_frames(&self, _input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        if let Some(gate) = &self.extract_gate {
            gate.notified().await;
        }
        std::fs::create_dir_all(out_dir)?;
        for index in 1..=self.frames {
            RgbImage::from_pixel(8, 6, Rgb([200, 40, 40])).save(out_dir.join(frame_file_name(index)))?;
        }
        list_frames(out_dir)
    }

    async fn encode_frames(
        &self,
        frame_dir: &Path,
        output: &Path,
        _options: &EncodeOptions,
    ) -> Result<PathBuf> {
        if self.fail_encode {
            return Err(ServiceError::ExternalToolFailed {
                tool: "ffmpeg".into(),
                status: "exit status: 1".into(),
                diagnostics: "Unknown encoder 'libvpx-vp9'".into(),
            });
        }
        let frames = list_frames(frame_dir)?;
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, format!("{} frames", frames.len()))?;
        Ok(output.to_path_buf())
    }
}

/// Accelerator-bound segmenter that records how many calls overlap
#[derive(Debug)]
pub struct OverlapCounter {
    name: String,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    delay: Duration,
}

impl OverlapCounter {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

impl Segmenter for OverlapCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_resource(&self) -> bool {
        true
    }

    fn to_resource(&self) -> Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn to_host(&self) -> Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn segment(&self, image: &DynamicImage) -> Result<RgbaImage> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(image.to_rgba8())
    }
}

/// Temporary scratch and output directories plus a config pointing at them
pub struct TestEnv {
    pub root: TempDir,
    pub config: ServiceConfig,
}

impl TestEnv {
    pub fn new(daily_limit: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = ServiceConfig::builder()
            .daily_limit(daily_limit)
            .abuse_threshold(daily_limit * 2)
            .batch_size(2)
            .scratch_dir(root.path().join("scratch"))
            .output_dir(root.path().join("outputs"))
            .build()
            .unwrap();
        Self { root, config }
    }

    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.config.storage.scratch_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn registry_with(segmenters: Vec<Arc<dyn Segmenter>>) -> SegmenterRegistry {
    let mut registry = SegmenterRegistry::new();
    for segmenter in segmenters {
        registry.register(segmenter);
    }
    registry
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 200, 90])));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// Bytes standing in for an uploaded video; the scripted codec never reads them
pub fn fake_video() -> Vec<u8> {
    b"\x00\x00\x00\x18ftypmp42".to_vec()
}
