//! Mock backend for unit tests
//!
//! Provides a `SegmentationBackend` that needs no model files, with scripted
//! outputs and failures.

use crate::{
    config::LocalConfig,
    error::{BgRemovalError, FailureCause, Result},
    inference::SegmentationBackend,
    models::{ModelInfo, PreprocessingConfig},
    types::{Segment, SegmentationMask},
};
use image::ImageEncoder;
use instant::Duration;
use ndarray::Array4;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Scripted behaviour of a [`MockBackend`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    /// Soft circular foreground mask through the regular tensor path
    Circle,
    /// Every mask value equals the given constant
    Constant(f32),
    /// Mask one value shorter than the image
    WrongLength,
    /// Empty result set
    Empty,
    /// Initialization fails with the given cause
    FailInit(FailureCause),
}

/// Mock segmentation backend
#[derive(Debug, Clone)]
pub struct MockBackend {
    behavior: MockBehavior,
    initialized: bool,
    init_calls: Arc<AtomicUsize>,
    segment_calls: Arc<AtomicUsize>,
}

impl MockBackend {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            initialized: false,
            init_calls: Arc::new(AtomicUsize::new(0)),
            segment_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `initialize` calls, shared across clones
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of `segment` calls, shared across clones
    #[must_use]
    pub fn segment_calls(&self) -> usize {
        self.segment_calls.load(Ordering::SeqCst)
    }
}

impl SegmentationBackend for MockBackend {
    fn initialize(&mut self, _config: &LocalConfig) -> Result<Option<Duration>> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let MockBehavior::FailInit(cause) = self.behavior {
            return Err(BgRemovalError::model_load(cause, "mock initialization failure"));
        }
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }
        let (_, _, height, width) = input.dim();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let radius = (width.min(height) as f32 / 3.0).max(1.0);

        Ok(Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
            let distance = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            ((radius - distance) / radius).clamp(0.0, 1.0)
        }))
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(PreprocessingConfig {
            target_size: [16, 16],
            ..PreprocessingConfig::default()
        })
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            name: "mock-segmenter".to_string(),
            precision: "fp32".to_string(),
            size_bytes: 1024,
            input_shape: (1, 3, 16, 16),
            labels: vec!["background".to_string()],
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn segment(&mut self, encoded: &[u8]) -> Result<Vec<Segment>> {
        self.segment_calls.fetch_add(1, Ordering::SeqCst);
        let (width, height) = image::load_from_memory(encoded)
            .map(|img| (img.width(), img.height()))
            .map_err(|e| BgRemovalError::inference(format!("mock decode failed: {e}")))?;
        let pixels = width as usize * height as usize;

        let mask = match self.behavior {
            MockBehavior::Circle => {
                // Regular tensor path
                let preprocessing = self.get_preprocessing_config()?;
                let image = image::load_from_memory(encoded)
                    .map_err(|e| BgRemovalError::inference(e.to_string()))?;
                let tensor =
                    crate::utils::ImagePreprocessor::preprocess_image(&image, &preprocessing)?;
                let output = self.infer(&tensor)?;
                return crate::utils::segments_from_logits(
                    &output,
                    &self.get_model_info()?,
                    width,
                    height,
                );
            },
            MockBehavior::Constant(value) => vec![value; pixels],
            MockBehavior::WrongLength => vec![0.5; pixels.saturating_sub(1)],
            MockBehavior::Empty => return Ok(Vec::new()),
            MockBehavior::FailInit(_) => {
                return Err(BgRemovalError::internal("Backend not initialized"))
            },
        };

        Ok(vec![Segment {
            label: "background".to_string(),
            score: None,
            mask: SegmentationMask::new(mask, (width, height)),
        }])
    }
}

/// Encode a solid test image as JPEG
#[must_use]
pub fn encoded_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap_or_default();
    out
}
