//! Tract segmenter for ONNX background removal models
//!
//! Pure Rust inference with no native runtime. For models marked as
//! accelerator-resident, activation builds the optimized runnable plan and
//! deactivation drops it, so only the lease holder keeps a plan in memory.
//! Other models build their plan on first use and keep it.

use crate::error::{Result, ServiceError};
use crate::segmentation::{apply_mask, ModelMethod, Segmenter};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, info};

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Input normalization for a model family
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessing {
    /// Square input edge in pixels
    pub target_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Padding color for aspect ratio preservation (RGB)
    pub padding_color: [u8; 3],
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self {
            target_size: 1024,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            padding_color: [255, 255, 255],
        }
    }
}

impl Preprocessing {
    /// Typical settings for a method
    #[must_use]
    pub fn for_method(method: ModelMethod) -> Self {
        match method {
            ModelMethod::U2net | ModelMethod::U2netHumanSeg | ModelMethod::Basnet => Self {
                target_size: 320,
                ..Self::default()
            },
            ModelMethod::IsnetGeneralUse | ModelMethod::IsnetAnime | ModelMethod::Ormbg => Self {
                mean: [0.5, 0.5, 0.5],
                std: [1.0, 1.0, 1.0],
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

/// Where the resized image sits inside the padded square canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

/// ONNX segmenter backed by tract
pub struct TractSegmenter {
    name: String,
    model_path: PathBuf,
    preprocessing: Preprocessing,
    needs_resource: bool,
    plan: Mutex<Option<Arc<TractModel>>>,
}

impl std::fmt::Debug for TractSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractSegmenter")
            .field("name", &self.name)
            .field("model_path", &self.model_path)
            .field("needs_resource", &self.needs_resource)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl TractSegmenter {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(
        name: &str,
        model_path: P,
        preprocessing: Preprocessing,
        needs_resource: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            model_path: model_path.into(),
            preprocessing,
            needs_resource,
            plan: Mutex::new(None),
        }
    }

    /// Segmenters for every catalog method with a `<method>.onnx` file in `dir`
    #[must_use]
    pub fn discover(dir: &Path) -> Vec<Self> {
        ModelMethod::ALL
            .iter()
            .filter(|method| **method != ModelMethod::Passthrough)
            .filter_map(|method| {
                let path = dir.join(format!("{}.onnx", method.as_str()));
                path.is_file().then(|| {
                    debug!(method = %method, path = %path.display(), "Found ONNX model");
                    Self::new(
                        method.as_str(),
                        path,
                        Preprocessing::for_method(*method),
                        method.prefers_accelerator(),
                    )
                })
            })
            .collect()
    }

    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Whether a runnable plan is currently held
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn build_plan(&self) -> Result<Arc<TractModel>> {
        let start = Instant::now();
        let size = self.preprocessing.target_size as usize;

        let plan = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .map_err(|e| {
                ServiceError::inference(format!(
                    "Failed to load ONNX model {}: {e}",
                    self.model_path.display()
                ))
            })?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(|e| ServiceError::inference(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| ServiceError::inference(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| ServiceError::inference(format!("Failed to create runnable model: {e}")))?;

        info!(
            model = %self.name,
            load_ms = start.elapsed().as_millis() as u64,
            "Tract plan ready"
        );
        Ok(Arc::new(plan))
    }

    fn plan(&self) -> Result<Arc<TractModel>> {
        let mut slot = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = slot.as_ref() {
            return Ok(Arc::clone(plan));
        }
        if self.needs_resource {
            return Err(ServiceError::inference(format!(
                "{} is not active on the accelerator",
                self.name
            )));
        }
        let plan = self.build_plan()?;
        *slot = Some(Arc::clone(&plan));
        Ok(plan)
    }
}

impl Segmenter for TractSegmenter {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_resource(&self) -> bool {
        self.needs_resource
    }

    fn to_resource(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let plan = self.build_plan()?;
        *self.plan.lock().unwrap_or_else(PoisonError::into_inner) = Some(plan);
        Ok(())
    }

    fn to_host(&self) -> Result<()> {
        if self.needs_resource {
            self.plan
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!(model = %self.name, "Tract plan released");
        }
        Ok(())
    }

    fn segment(&self, image: &DynamicImage) -> Result<RgbaImage> {
        let plan = self.plan()?;
        let size = self.preprocessing.target_size as usize;
        let (input, placement) = preprocess(image, &self.preprocessing)?;

        let tensor = Tensor::from_shape::<f32>(&[1, 3, size, size], &input)
            .map_err(|e| ServiceError::inference(format!("Failed to build input tensor: {e}")))?;
        let outputs = plan
            .run(tvec![tensor.into()])
            .map_err(|e| ServiceError::inference(format!("Tract inference failed: {e}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| ServiceError::inference("No output tensor found"))?;

        let shape = output.shape();
        let (out_h, out_w) = match shape {
            [_, _, h, w] | [_, h, w] | [h, w] => (*h, *w),
            _ => {
                return Err(ServiceError::inference(format!(
                    "Unexpected output tensor shape {shape:?}"
                )))
            },
        };
        let values = output
            .as_slice::<f32>()
            .map_err(|e| ServiceError::inference(format!("Failed to read output tensor: {e}")))?;

        let mask = crop_mask(values, out_w, out_h, self.preprocessing.target_size, placement)?;
        Ok(apply_mask(image, &mask))
    }
}

/// Resize preserving aspect ratio, pad to a square and normalize to NCHW
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn preprocess(image: &DynamicImage, config: &Preprocessing) -> Result<(Vec<f32>, Placement)> {
    let target = config.target_size;
    let rgb = image.to_rgb8();
    let (orig_width, orig_height) = rgb.dimensions();
    if orig_width == 0 || orig_height == 0 {
        return Err(ServiceError::validation("Image has no pixels"));
    }

    let scale = (target as f32 / orig_width as f32).min(target as f32 / orig_height as f32);
    let width = ((orig_width as f32 * scale).round() as u32).clamp(1, target);
    let height = ((orig_height as f32 * scale).round() as u32).clamp(1, target);

    let resized = image::imageops::resize(&rgb, width, height, image::imageops::FilterType::Triangle);
    let pad = config.padding_color;
    let mut canvas: RgbImage = ImageBuffer::from_pixel(target, target, image::Rgb(pad));
    let placement = Placement {
        offset_x: (target - width) / 2,
        offset_y: (target - height) / 2,
        width,
        height,
    };
    image::imageops::replace(
        &mut canvas,
        &resized,
        i64::from(placement.offset_x),
        i64::from(placement.offset_y),
    );

    let plane = (target as usize) * (target as usize);
    let mut tensor = vec![0.0_f32; plane * 3];
    for (index, pixel) in canvas.pixels().enumerate() {
        for channel in 0..3 {
            let value = f32::from(pixel.0[channel]) / 255.0;
            if let Some(slot) = tensor.get_mut(channel * plane + index) {
                *slot = (value - config.mean[channel]) / config.std[channel];
            }
        }
    }
    Ok((tensor, placement))
}

/// Cut the region covering the original image out of a square model output
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn crop_mask(
    values: &[f32],
    out_width: usize,
    out_height: usize,
    target: u32,
    placement: Placement,
) -> Result<GrayImage> {
    if values.len() < out_width * out_height || out_width == 0 || out_height == 0 {
        return Err(ServiceError::inference(format!(
            "Output tensor holds {} values, expected {out_width}x{out_height}",
            values.len()
        )));
    }

    let scale_x = out_width as f32 / target as f32;
    let scale_y = out_height as f32 / target as f32;
    let mut mask = GrayImage::new(placement.width, placement.height);
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        let src_x = (((placement.offset_x + x) as f32 * scale_x) as usize).min(out_width - 1);
        let src_y = (((placement.offset_y + y) as f32 * scale_y) as usize).min(out_height - 1);
        let value = values.get(src_y * out_width + src_x).copied().unwrap_or(0.0);
        *pixel = Luma([(value.clamp(0.0, 1.0) * 255.0).round() as u8]);
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_pads_and_normalizes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 50, Rgb([255, 0, 0])));
        let config = Preprocessing {
            target_size: 64,
            ..Preprocessing::default()
        };

        let (tensor, placement) = preprocess(&image, &config).unwrap();
        assert_eq!(tensor.len(), 3 * 64 * 64);
        assert_eq!(
            placement,
            Placement {
                offset_x: 0,
                offset_y: 16,
                width: 64,
                height: 32
            }
        );

        // Red pixel at the canvas center
        let center = 32 * 64 + 32;
        let expected_r = (1.0 - 0.485) / 0.229;
        assert!((tensor[center] - expected_r).abs() < 1e-4);
        // White padding in the top row
        let expected_pad_b = (1.0 - 0.406) / 0.225;
        assert!((tensor[2 * 64 * 64] - expected_pad_b).abs() < 1e-4);
    }

    #[test]
    fn test_crop_mask_uses_placement() {
        // 4x4 output where the bottom half is foreground
        let values: Vec<f32> = (0..16).map(|i| if i >= 8 { 1.0 } else { 0.0 }).collect();
        let placement = Placement {
            offset_x: 0,
            offset_y: 2,
            width: 4,
            height: 2,
        };
        let mask = crop_mask(&values, 4, 4, 4, placement).unwrap();
        assert_eq!(mask.dimensions(), (4, 2));
        assert!(mask.pixels().all(|p| p.0[0] == 255));

        assert!(crop_mask(&values[..4], 4, 4, 4, placement).is_err());
    }

    #[test]
    fn test_missing_model_fails_activation() {
        let segmenter = TractSegmenter::new(
            "ormbg",
            "/nonexistent/ormbg.onnx",
            Preprocessing::default(),
            true,
        );
        assert!(segmenter.to_resource().is_err());
        assert!(!segmenter.is_loaded());

        let image = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let err = segmenter.segment(&image).unwrap_err();
        assert!(err.to_string().contains("not active"));
        assert!(segmenter.to_host().is_ok());
    }

    #[test]
    fn test_discover_finds_catalog_models() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("u2net.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("ormbg.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("custom.onnx"), b"x").unwrap();

        let mut found: Vec<_> = TractSegmenter::discover(dir.path())
            .into_iter()
            .map(|s| (s.name().to_string(), s.needs_resource()))
            .collect();
        found.sort();
        assert_eq!(found, vec![("ormbg".to_string(), true), ("u2net".to_string(), false)]);
    }
}
