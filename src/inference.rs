//! Segmentation backend abstraction and factory

use crate::{
    config::{BackendType, ExecutionProvider, LocalConfig},
    error::{BgRemovalError, FailureCause, Result},
    models::{ModelInfo, ModelManager, PreprocessingConfig},
    types::Segment,
    utils::{segments_from_logits, ImagePreprocessor},
};
use async_trait::async_trait;
use ndarray::Array4;

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Trait for segmentation inference backends
///
/// Implementations provide tensor inference; [`SegmentationBackend::segment`]
/// wraps it with decoding, preprocessing and logits postprocessing.
pub trait SegmentationBackend: Send {
    /// Initialize the backend, returning the model load time on first call
    ///
    /// # Errors
    /// - Requested execution provider unavailable (cause: unsupported device)
    /// - Model loading or validation errors
    fn initialize(&mut self, config: &LocalConfig) -> Result<Option<Duration>>;

    /// Run inference on an NCHW input tensor
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Get preprocessing configuration for this backend
    ///
    /// # Errors
    /// - Model metadata unavailable
    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig>;

    /// Get model information for this backend
    ///
    /// # Errors
    /// - Model metadata unavailable
    fn get_model_info(&self) -> Result<ModelInfo>;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;

    /// Segment an encoded image
    ///
    /// Every returned mask matches the encoded image's dimensions.
    ///
    /// # Errors
    /// - Encoded image cannot be decoded
    /// - Inference or output conversion failures
    fn segment(&mut self, encoded: &[u8]) -> Result<Vec<Segment>> {
        let image = image::load_from_memory(encoded).map_err(|e| {
            BgRemovalError::inference(format!("Failed to decode model input image: {e}"))
        })?;
        let preprocessing = self.get_preprocessing_config()?;
        let tensor = ImagePreprocessor::preprocess_image(&image, &preprocessing)?;
        let output = self.infer(&tensor)?;
        let info = self.get_model_info()?;
        segments_from_logits(&output, &info, image.width(), image.height())
    }
}

/// Factory for creating segmentation backends
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Resolve model files and construct an uninitialized backend
    ///
    /// # Errors
    /// - Backend type not compiled in
    /// - Model resolution or download failures
    async fn create_backend(
        &self,
        config: &LocalConfig,
        use_local_model_cache: bool,
    ) -> Result<Box<dyn SegmentationBackend>>;

    /// List available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Factory for the backends compiled into this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl DefaultBackendFactory {
    fn construct(
        backend_type: BackendType,
        manager: ModelManager,
    ) -> Result<Box<dyn SegmentationBackend>> {
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(
                crate::backends::OnnxBackend::with_model_manager(manager),
            )),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(
                crate::backends::TractBackend::with_model_manager(manager),
            )),
            #[allow(unreachable_patterns)]
            other => {
                drop(manager);
                Err(BgRemovalError::invalid_config(format!(
                    "The {other} backend is not compiled into this build"
                )))
            },
        }
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create_backend(
        &self,
        config: &LocalConfig,
        use_local_model_cache: bool,
    ) -> Result<Box<dyn SegmentationBackend>> {
        if !self.available_backends().contains(&config.backend_type) {
            return Err(BgRemovalError::invalid_config(format!(
                "The {} backend is not compiled into this build",
                config.backend_type
            )));
        }
        if config.backend_type == BackendType::Tract
            && config.execution_provider != ExecutionProvider::Cpu
        {
            return Err(BgRemovalError::model_load(
                FailureCause::UnsupportedDevice,
                format!(
                    "The tract backend only runs on CPU, {} was requested",
                    config.execution_provider
                ),
            ));
        }

        let manager = ModelManager::resolve(config, use_local_model_cache).await?;
        Self::construct(config.backend_type, manager)
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends
    }
}
