//! ONNX Runtime backend for segmentation models
//!
//! Runs on CPU unless an accelerator is explicitly requested. A requested
//! accelerator that ONNX Runtime cannot provide fails initialization with an
//! unsupported-device cause instead of falling back.

use crate::config::{ExecutionProvider, LocalConfig};
use crate::error::{BgRemovalError, FailureCause, Result};
use crate::inference::SegmentationBackend;
use crate::models::{ModelInfo, ModelManager, PreprocessingConfig};
use log;
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::{self, value::Value};

/// ONNX Runtime backend
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Session>,
    model_manager: ModelManager,
    model_info: Option<ModelInfo>,
    initialized: bool,
}

impl OnnxBackend {
    /// List ONNX Runtime execution providers with availability status
    ///
    /// # Examples
    /// ```rust,no_run
    /// use bgremove_fallback::backends::OnnxBackend;
    ///
    /// for (name, available, description) in OnnxBackend::list_providers() {
    ///     println!("{name}: {available} - {description}");
    /// }
    /// ```
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                Self::provider_available(ExecutionProvider::Cuda),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                Self::provider_available(ExecutionProvider::CoreMl),
                "Apple Silicon acceleration (macOS only)".to_string(),
            ),
        ]
    }

    fn provider_available(provider: ExecutionProvider) -> bool {
        match provider {
            ExecutionProvider::Cpu => true,
            ExecutionProvider::Cuda => {
                OrtExecutionProvider::is_available(&CUDAExecutionProvider::default())
                    .unwrap_or(false)
            },
            ExecutionProvider::CoreMl => {
                OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                    .unwrap_or(false)
            },
        }
    }

    /// Create a backend for the resolved model files
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        Self {
            session: None,
            model_manager,
            model_info: None,
            initialized: false,
        }
    }

    fn load_model(&mut self, config: &LocalConfig) -> Result<std::time::Duration> {
        let model_load_start = std::time::Instant::now();
        let provider = config.execution_provider;

        if !Self::provider_available(provider) {
            log::warn!("Execution provider {provider} requested but not available");
            return Err(BgRemovalError::model_load(
                FailureCause::UnsupportedDevice,
                format!("Execution provider {provider} is not available on this machine"),
            ));
        }

        let model_data = self.model_manager.load_model()?;
        let model_info = self.model_manager.get_info()?;

        let session_builder = Session::builder()
            .map_err(|e| runtime_error(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| runtime_error(format!("Failed to set optimization level: {e}")))?;

        let session_builder = match provider {
            ExecutionProvider::Cpu => {
                log::info!("Using CPU execution provider");
                session_builder
            },
            ExecutionProvider::Cuda => session_builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| device_error(format!("Failed to set CUDA execution provider: {e}")))?,
            ExecutionProvider::CoreMl => session_builder
                .with_execution_providers([CoreMLExecutionProvider::default()
                    .with_subgraphs(true)
                    .build()
                    .error_on_failure()])
                .map_err(|e| {
                    device_error(format!("Failed to set CoreML execution provider: {e}"))
                })?,
        };

        let intra_threads = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| runtime_error(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| runtime_error(format!("Failed to create session from model data: {e}")))?;

        log::debug!("ONNX Runtime session created");
        log::debug!("  - Provider: {provider}");
        log::debug!("  - Threading: {intra_threads} intra-op threads");
        log::debug!("  - Model: {} ({})", model_info.name, model_info.precision);
        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = model_info.size_bytes as f64 / (1024.0 * 1024.0);
        log::debug!("  - Model size: {size_mb:.2} MB");

        self.session = Some(session);
        self.model_info = Some(model_info);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

fn runtime_error(message: String) -> BgRemovalError {
    BgRemovalError::model_load(FailureCause::Other, message)
}

fn device_error(message: String) -> BgRemovalError {
    BgRemovalError::model_load(FailureCause::UnsupportedDevice, message)
}

impl SegmentationBackend for OnnxBackend {
    fn initialize(&mut self, config: &LocalConfig) -> Result<Option<std::time::Duration>> {
        if self.initialized {
            return Ok(None);
        }
        self.load_model(config).map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgRemovalError::internal("ONNX session not initialized"))?;

        let inference_start = std::time::Instant::now();
        log::debug!("Starting inference with input shape: {:?}", input.dim());

        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert input tensor: {e}"))
        })?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        // Positional access: first output holds the logits
        let output_tensor = {
            let keys: Vec<_> = outputs.keys().collect();
            let first_key = keys
                .first()
                .ok_or_else(|| BgRemovalError::inference("No output tensors found"))?;
            outputs
                .get(first_key)
                .ok_or_else(|| BgRemovalError::inference("First output tensor not found"))?
                .try_extract_array::<f32>()
                .map_err(|e| {
                    BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
                })?
        };

        let output_shape = output_tensor.shape().to_vec();
        let [batch, classes, height, width] = output_shape.as_slice() else {
            return Err(BgRemovalError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };

        let output = Array4::from_shape_vec(
            (*batch, *classes, *height, *width),
            output_tensor.iter().copied().collect(),
        )
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::info!(
            "Inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(output)
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(self.model_manager.get_preprocessing_config())
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        match &self.model_info {
            Some(info) => Ok(info.clone()),
            None => self.model_manager.get_info(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
