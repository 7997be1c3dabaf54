//! Tract backend for segmentation models
//!
//! Pure Rust inference on CPU. Tract has no accelerator support, so any other
//! execution provider is rejected as an unsupported device.

use crate::config::{ExecutionProvider, LocalConfig};
use crate::error::{BgRemovalError, FailureCause, Result};
use crate::inference::SegmentationBackend;
use crate::models::{ModelInfo, ModelManager, PreprocessingConfig};
use log;
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Type alias for the optimized runnable Tract graph
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

use instant::{Duration, Instant};

/// Tract backend for segmentation models
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    model_manager: ModelManager,
    initialized: bool,
}

impl TractBackend {
    /// List Tract execution providers with availability status
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Create a Tract backend for the resolved model files
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        Self {
            model: None,
            model_manager,
            initialized: false,
        }
    }

    fn load_model(&mut self, config: &LocalConfig) -> Result<Duration> {
        if config.execution_provider != ExecutionProvider::Cpu {
            return Err(BgRemovalError::model_load(
                FailureCause::UnsupportedDevice,
                format!(
                    "Tract runs on CPU only, {} was requested",
                    config.execution_provider
                ),
            ));
        }

        let model_load_start = Instant::now();
        let model_data = self.model_manager.load_model()?;
        let model_info = self.model_manager.get_info()?;
        let [height, width] = self.model_manager.get_preprocessing_config().target_size;

        log::debug!("Initializing Tract backend");
        log::debug!("  - Model: {} ({})", model_info.name, model_info.precision);
        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = model_info.size_bytes as f64 / (1024.0 * 1024.0);
        log::debug!("  - Model size: {size_mb:.2} MB");

        // Segformer exports carry symbolic spatial dims; pin them to the preprocessing size
        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| load_error(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .map_err(|e| load_error(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| load_error(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| load_error(format!("Failed to create runnable model: {e}")))?;

        self.model = Some(model);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Tract backend initialized in {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

fn load_error(message: String) -> BgRemovalError {
    BgRemovalError::model_load(FailureCause::Other, message)
}

impl SegmentationBackend for TractBackend {
    fn initialize(&mut self, config: &LocalConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        self.load_model(config).map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BgRemovalError::internal("Tract model not initialized"))?;

        let inference_start = Instant::now();
        log::debug!("Running Tract inference on {:?}", input.shape());

        let outputs = model
            .run(tvec![Tensor::from(input.clone()).into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BgRemovalError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_data = output_tensor.to_array_view::<f32>().map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        let shape = output_data.shape().to_vec();
        let [batch, classes, height, width] = shape.as_slice() else {
            return Err(BgRemovalError::inference(format!(
                "Expected 4D output tensor, got {}D",
                shape.len()
            )));
        };

        let output = Array4::from_shape_vec(
            (*batch, *classes, *height, *width),
            output_data.iter().copied().collect(),
        )
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "Tract inference completed in {:.2}ms, output {:?}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            output.shape()
        );
        Ok(output)
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(self.model_manager.get_preprocessing_config())
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.model_manager.get_info()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
