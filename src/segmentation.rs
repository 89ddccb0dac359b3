//! Segmentation capability abstraction and registry
//!
//! A [`Segmenter`] turns an image into the same image with its background made
//! transparent. Some model families live on the shared accelerator and must be
//! moved there (and back) under the arbiter's lease; others run in place.

use crate::error::{Result, ServiceError};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbaImage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A background removal model family
pub trait Segmenter: Send + Sync {
    /// Method name clients select this model by
    fn name(&self) -> &str;

    /// Whether inference must happen inside an accelerator lease
    fn needs_resource(&self) -> bool;

    /// Move the model onto the shared accelerator
    ///
    /// Called by the arbiter while holding the exclusive token.
    fn to_resource(&self) -> Result<()> {
        Ok(())
    }

    /// Move the model off the accelerator and reclaim its memory
    fn to_host(&self) -> Result<()> {
        Ok(())
    }

    /// Produce the foreground image with a transparent background
    ///
    /// # Errors
    /// - Model not activated when it needs the accelerator
    /// - Inference failures
    fn segment(&self, image: &DynamicImage) -> Result<RgbaImage>;
}

/// Known method names
///
/// The catalog mirrors the families the hosted service advertises. Each one is
/// served only if a [`Segmenter`] is registered under its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelMethod {
    Bria,
    Inspyrenet,
    U2netHumanSeg,
    IsnetGeneralUse,
    IsnetAnime,
    Ormbg,
    U2net,
    Tracer,
    Basnet,
    Deeplab,
    Passthrough,
}

impl ModelMethod {
    pub const ALL: [ModelMethod; 11] = [
        Self::Bria,
        Self::Inspyrenet,
        Self::U2netHumanSeg,
        Self::IsnetGeneralUse,
        Self::IsnetAnime,
        Self::Ormbg,
        Self::U2net,
        Self::Tracer,
        Self::Basnet,
        Self::Deeplab,
        Self::Passthrough,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bria => "bria",
            Self::Inspyrenet => "inspyrenet",
            Self::U2netHumanSeg => "u2net_human_seg",
            Self::IsnetGeneralUse => "isnet-general-use",
            Self::IsnetAnime => "isnet-anime",
            Self::Ormbg => "ormbg",
            Self::U2net => "u2net",
            Self::Tracer => "tracer",
            Self::Basnet => "basnet",
            Self::Deeplab => "deeplab",
            Self::Passthrough => "passthrough",
        }
    }

    /// Parse a client-supplied method name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Whether this family is normally hosted on the accelerator
    #[must_use]
    pub fn prefers_accelerator(&self) -> bool {
        matches!(self, Self::Ormbg | Self::Inspyrenet | Self::Bria)
    }
}

impl std::fmt::Display for ModelMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of segmenters keyed by method name
#[derive(Default)]
pub struct SegmenterRegistry {
    segmenters: BTreeMap<String, Arc<dyn Segmenter>>,
}

impl std::fmt::Debug for SegmenterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmenterRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

impl SegmenterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segmenter under its own name, replacing any previous one
    pub fn register(&mut self, segmenter: Arc<dyn Segmenter>) {
        self.segmenters
            .insert(segmenter.name().to_string(), segmenter);
    }

    /// Look up the segmenter for a client-supplied method
    pub fn get(&self, method: &str) -> Result<Arc<dyn Segmenter>> {
        self.segmenters.get(method).cloned().ok_or_else(|| {
            ServiceError::validation(format!(
                "Invalid method '{method}'. Available methods: {}",
                self.methods().join(", ")
            ))
        })
    }

    /// Registered method names in sorted order
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.segmenters.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segmenters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segmenters.is_empty()
    }
}

/// No-op segmenter: returns the input unchanged as opaque RGBA
///
/// Serves as the test stub for the pipeline and as a smoke-test method. It can
/// pretend to need the accelerator so the arbiter path is exercised; it counts
/// activations so callers can check that every activation was undone.
#[derive(Debug)]
pub struct PassthroughSegmenter {
    name: String,
    needs_resource: bool,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
}

impl PassthroughSegmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::named(ModelMethod::Passthrough.as_str(), false)
    }

    #[must_use]
    pub fn named(name: &str, needs_resource: bool) -> Self {
        Self {
            name: name.to_string(),
            needs_resource,
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

impl Default for PassthroughSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter for PassthroughSegmenter {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_resource(&self) -> bool {
        self.needs_resource
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
        Ok(image.to_rgba8())
    }
}

/// Write `mask` into the alpha channel of `image`
///
/// The mask is resized to the image dimensions when they differ.
#[must_use]
pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> RgbaImage {
    let mut rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();

    let resized;
    let mask = if mask.dimensions() == (width, height) {
        mask
    } else {
        resized = image::imageops::resize(mask, width, height, FilterType::Triangle);
        &resized
    };

    for (pixel, alpha) in rgba.pixels_mut().zip(mask.pixels()) {
        pixel.0[3] = alpha.0[0];
    }
    rgba
}
