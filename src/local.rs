//! Local background removal with a segmentation model
//!
//! The decoded source is bounded, re-encoded as a lossy JPEG intermediate and
//! segmented. The first segment's mask becomes the alpha channel of the bounded
//! canvas, and the result is encoded as PNG.

use crate::canvas::Resizer;
use crate::compositing::{composite, encode_jpeg, encode_png};
use crate::config::{LocalConfig, MaskPolarity, PipelineConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::{BackendFactory, DefaultBackendFactory};
use crate::services::{ProcessingStage, ProgressTracker};
use crate::session_cache::{BackendCache, SharedBackend};
use crate::strategy::{RemovalRequest, RemovalStrategy};
use crate::types::{
    BoundedCanvas, OutputImage, ProcessingMetadata, ProcessingTimings, Segment,
    SegmentationMask, SourceImage, StrategyKind,
};
use async_trait::async_trait;
use image::ImageFormat;
use instant::Instant;
use std::sync::Arc;

/// Runs segmentation on this machine
pub struct LocalInferenceStrategy {
    config: LocalConfig,
    use_local_model_cache: bool,
    max_dimension: u32,
    factory: Arc<dyn BackendFactory>,
    backends: Arc<BackendCache>,
}

impl std::fmt::Debug for LocalInferenceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInferenceStrategy")
            .field("config", &self.config)
            .field("use_local_model_cache", &self.use_local_model_cache)
            .field("max_dimension", &self.max_dimension)
            .finish_non_exhaustive()
    }
}

impl LocalInferenceStrategy {
    /// Strategy using the compiled-in backends and the process-wide backend cache
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_factory(
            config,
            Arc::new(DefaultBackendFactory),
            BackendCache::global(),
        )
    }

    /// Strategy with an explicit backend factory and cache
    #[must_use]
    pub fn with_factory(
        config: &PipelineConfig,
        factory: Arc<dyn BackendFactory>,
        backends: Arc<BackendCache>,
    ) -> Self {
        Self {
            config: config.local.clone(),
            use_local_model_cache: config.use_local_model_cache,
            max_dimension: config.max_dimension,
            factory,
            backends,
        }
    }
}

#[async_trait]
impl RemovalStrategy for LocalInferenceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Local
    }

    async fn remove(&self, request: &RemovalRequest<'_>) -> Result<OutputImage> {
        request.progress.report_stage(ProcessingStage::ModelLoading);
        let (backend, load_time) = self
            .backends
            .get_or_init(&self.config, self.use_local_model_cache, self.factory.as_ref())
            .await?;

        let image = Arc::clone(&request.image);
        let progress = request.progress.clone();
        let max_dimension = self.max_dimension;
        let quality = self.config.intermediate_jpeg_quality;
        let polarity = self.config.mask_polarity;

        let mut output = tokio::task::spawn_blocking(move || {
            run_blocking(&backend, &image, max_dimension, quality, polarity, &progress)
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Local inference task failed: {e}")))??;

        output.metadata.timings.model_load_ms = load_time.map(|d| d.as_millis() as u64);
        Ok(output)
    }
}

fn run_blocking(
    backend: &SharedBackend,
    image: &SourceImage,
    max_dimension: u32,
    quality: u8,
    polarity: MaskPolarity,
    progress: &ProgressTracker,
) -> Result<OutputImage> {
    let mut timings = ProcessingTimings::new();

    progress.report_stage(ProcessingStage::Resizing);
    let start = Instant::now();
    let (canvas, was_resized) = Resizer::bound(image, max_dimension);
    let intermediate = encode_jpeg(&canvas, quality)?;
    timings.preprocessing_ms = start.elapsed().as_millis() as u64;

    progress.report_stage(ProcessingStage::Inference);
    let start = Instant::now();
    let (segments, model_name) = {
        let mut backend = backend
            .lock()
            .map_err(|_| BgRemovalError::internal("Segmentation backend lock poisoned"))?;
        let segments = backend.segment(&intermediate)?;
        (segments, backend.get_model_info().ok().map(|info| info.name))
    };
    timings.inference_ms = start.elapsed().as_millis() as u64;

    let mask = primary_mask(&segments, &canvas)?;

    progress.report_stage(ProcessingStage::Compositing);
    let start = Instant::now();
    let composited = composite(&canvas, mask, polarity)?;
    progress.report_stage(ProcessingStage::Encoding);
    let bytes = encode_png(&composited)?;
    timings.postprocessing_ms = start.elapsed().as_millis() as u64;

    log::debug!(
        "Local removal produced {}x{} PNG ({} bytes, {} segment(s))",
        canvas.width(),
        canvas.height(),
        bytes.len(),
        segments.len()
    );

    Ok(OutputImage {
        bytes,
        format: Some(ImageFormat::Png),
        dimensions: Some((canvas.width(), canvas.height())),
        strategy: StrategyKind::Local,
        metadata: ProcessingMetadata {
            timings,
            was_resized,
            model_name,
            ..ProcessingMetadata::default()
        },
    })
}

/// Mask of the first segment, checked against the canvas
///
/// Masks of the wrong size are rejected outright, never truncated or padded.
///
/// # Errors
/// - Empty result set
/// - Mask length or dimensions differ from the canvas
/// - Non-finite mask values
pub fn primary_mask<'a>(
    segments: &'a [Segment],
    canvas: &BoundedCanvas,
) -> Result<&'a SegmentationMask> {
    let first = segments
        .first()
        .ok_or_else(|| BgRemovalError::inference("Segmentation returned no results"))?;
    let mask = &first.mask;

    let expected = canvas.pixel_count();
    if mask.len() != expected || mask.dimensions != (canvas.width(), canvas.height()) {
        return Err(BgRemovalError::inference(format!(
            "Mask has {} values ({}x{}) but the canvas is {}x{} ({expected} values)",
            mask.len(),
            mask.dimensions.0,
            mask.dimensions.1,
            canvas.width(),
            canvas.height()
        )));
    }

    if let Some(index) = mask.data.iter().position(|v| !v.is_finite()) {
        return Err(BgRemovalError::inference(format!(
            "Mask value at index {index} is not finite"
        )));
    }

    Ok(mask)
}
