//! Configuration types for background removal operations

use crate::error::{BgRemovalError, Result};
use crate::models::{ModelSource, ModelSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default remote background removal endpoint
pub const DEFAULT_REMOTE_ENDPOINT: &str = "https://api.remove.bg/v1.0/removebg";

/// Default segmentation model repository
pub const DEFAULT_MODEL_ID: &str = "Xenova/segformer-b0-finetuned-ade-512-512";

/// Default model hub base URL
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// Largest canvas side handed to local inference
pub const MAX_IMAGE_DIMENSION: u32 = 1024;

/// Default ceiling on unresolved attempts per source image
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

/// Execution provider options for local inference
///
/// CPU is the default. Accelerators are only used when explicitly requested and
/// fail with an unsupported-device error when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionProvider {
    /// CPU execution (always available)
    #[default]
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Backend type enumeration for runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    /// ONNX Runtime backend
    Onnx,
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Tract
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

/// Which class the segmentation mask describes
///
/// This is a property of the model. With `Background`, a mask value of 1.0
/// becomes fully transparent; with `Foreground`, it stays fully opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MaskPolarity {
    /// Mask value is the probability that the pixel is background
    #[default]
    Background,
    /// Mask value is the probability that the pixel is foreground
    Foreground,
}

/// Remote strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Endpoint receiving the multipart upload
    pub endpoint: String,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REMOTE_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Local inference strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Model specification including source and variant
    pub model_spec: ModelSpec,
    /// Backend type to use for inference
    pub backend_type: BackendType,
    /// Execution provider for the backend
    pub execution_provider: ExecutionProvider,
    /// Quality of the JPEG intermediate handed to the model (1-100)
    pub intermediate_jpeg_quality: u8,
    /// Semantics of the model's mask
    pub mask_polarity: MaskPolarity,
    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
    /// Model cache directory override
    pub cache_dir: Option<PathBuf>,
    /// Model hub base URL
    pub hub_url: String,
    /// Timeout for each model file download
    pub download_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            model_spec: ModelSpec {
                source: ModelSource::Downloaded(DEFAULT_MODEL_ID.to_string()),
                variant: Some("fp32".to_string()),
            },
            backend_type: BackendType::default(),
            execution_provider: ExecutionProvider::Cpu,
            intermediate_jpeg_quality: 80,
            mask_polarity: MaskPolarity::Background,
            intra_threads: 0,
            cache_dir: None,
            hub_url: DEFAULT_HUB_URL.to_string(),
            download_timeout: Duration::from_secs(300),
        }
    }
}

/// Configuration for the whole removal pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reuse model files already present in the on-disk cache
    pub use_local_model_cache: bool,

    /// Built-in remote credential used when the caller supplies none
    pub default_credential: Option<String>,

    /// Largest side of the canvas used for local inference
    pub max_dimension: u32,

    /// Unresolved attempts allowed per source image
    pub max_attempts: usize,

    /// Decoder allocation limit in bytes
    pub max_decode_alloc_bytes: u64,

    /// Remote strategy settings
    pub remote: RemoteConfig,

    /// Local strategy settings
    pub local: LocalConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_local_model_cache: true,
            default_credential: None,
            max_dimension: MAX_IMAGE_DIMENSION,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_decode_alloc_bytes: 512 * 1024 * 1024,
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder for fluent API construction
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bgremove_fallback::PipelineConfig;
    ///
    /// let config = PipelineConfig::builder()
    ///     .default_credential("my-api-key")
    ///     .max_dimension(768)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.max_dimension, 768);
    /// ```
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - `max_dimension` or `max_attempts` is zero
    /// - JPEG quality outside 1-100
    /// - Remote endpoint is not an http(s) URL, or a timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_dimension == 0 {
            return Err(BgRemovalError::config_value_error(
                "max dimension",
                self.max_dimension,
                "1 or more",
                Some(MAX_IMAGE_DIMENSION),
            ));
        }

        if self.max_attempts == 0 {
            return Err(BgRemovalError::config_value_error(
                "max attempts",
                self.max_attempts,
                "1 or more",
                Some(DEFAULT_MAX_ATTEMPTS),
            ));
        }

        let quality = self.local.intermediate_jpeg_quality;
        if !(1..=100).contains(&quality) {
            return Err(BgRemovalError::config_value_error(
                "JPEG quality",
                quality,
                "1-100",
                Some(80),
            ));
        }

        let endpoint = self.remote.endpoint.as_str();
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(BgRemovalError::invalid_config(format!(
                "Remote endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }

        if self.remote.timeout.is_zero() || self.local.download_timeout.is_zero() {
            return Err(BgRemovalError::invalid_config("Timeouts must be non-zero"));
        }

        Ok(())
    }
}

/// Builder for `PipelineConfig`
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn use_local_model_cache(mut self, enabled: bool) -> Self {
        self.config.use_local_model_cache = enabled;
        self
    }

    /// Set the built-in credential; empty strings clear it
    #[must_use]
    pub fn default_credential<S: Into<String>>(mut self, credential: S) -> Self {
        let credential = credential.into();
        self.config.default_credential = (!credential.trim().is_empty()).then_some(credential);
        self
    }

    #[must_use]
    pub fn max_dimension(mut self, max_dimension: u32) -> Self {
        self.config.max_dimension = max_dimension;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn max_decode_alloc_bytes(mut self, bytes: u64) -> Self {
        self.config.max_decode_alloc_bytes = bytes;
        self
    }

    #[must_use]
    pub fn remote_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.config.remote.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.config.remote.timeout = timeout;
        self
    }

    #[must_use]
    pub fn model_spec(mut self, model_spec: ModelSpec) -> Self {
        self.config.local.model_spec = model_spec;
        self
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.config.local.backend_type = backend_type;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.local.execution_provider = provider;
        self
    }

    /// Set JPEG intermediate quality (clamped to 1-100)
    #[must_use]
    pub fn intermediate_jpeg_quality(mut self, quality: u8) -> Self {
        self.config.local.intermediate_jpeg_quality = quality.clamp(1, 100);
        self
    }

    #[must_use]
    pub fn mask_polarity(mut self, polarity: MaskPolarity) -> Self {
        self.config.local.mask_polarity = polarity;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.local.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.local.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn hub_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.local.hub_url = url.into();
        self
    }

    #[must_use]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.local.download_timeout = timeout;
        self
    }

    /// Build the pipeline configuration
    ///
    /// # Errors
    /// Any failure reported by [`PipelineConfig::validate`]
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.use_local_model_cache);
        assert_eq!(config.default_credential, None);
        assert_eq!(config.max_dimension, 1024);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.remote.endpoint, DEFAULT_REMOTE_ENDPOINT);
        assert_eq!(config.local.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.local.intermediate_jpeg_quality, 80);
        assert_eq!(config.local.mask_polarity, MaskPolarity::Background);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = PipelineConfig::builder()
            .use_local_model_cache(false)
            .default_credential("key-123")
            .max_dimension(512)
            .max_attempts(3)
            .remote_timeout(Duration::from_secs(5))
            .mask_polarity(MaskPolarity::Foreground)
            .build()
            .unwrap();

        assert!(!config.use_local_model_cache);
        assert_eq!(config.default_credential.as_deref(), Some("key-123"));
        assert_eq!(config.max_dimension, 512);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.remote.timeout, Duration::from_secs(5));
        assert_eq!(config.local.mask_polarity, MaskPolarity::Foreground);
    }

    #[test]
    fn test_blank_credential_is_ignored() {
        let config = PipelineConfig::builder()
            .default_credential("   ")
            .build()
            .unwrap();
        assert_eq!(config.default_credential, None);
    }

    #[test]
    fn test_jpeg_quality_clamped_in_builder() {
        let config = PipelineConfig::builder()
            .intermediate_jpeg_quality(0)
            .build()
            .unwrap();
        assert_eq!(config.local.intermediate_jpeg_quality, 1);
    }

    #[test]
    fn test_validation_failures() {
        assert!(PipelineConfig::builder().max_dimension(0).build().is_err());
        assert!(PipelineConfig::builder().max_attempts(0).build().is_err());
        assert!(PipelineConfig::builder()
            .remote_endpoint("ftp://example.com/removebg")
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .remote_timeout(Duration::ZERO)
            .build()
            .is_err());

        let mut config = PipelineConfig::default();
        config.local.intermediate_jpeg_quality = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JPEG quality"));
        assert!(err.to_string().contains("101"));
    }

    #[test]
    fn test_serde_round_trip_preserves_settings() {
        let config = PipelineConfig::builder()
            .default_credential("abc")
            .backend_type(BackendType::Tract)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_display_impls() {
        assert_eq!(ExecutionProvider::Cpu.to_string(), "cpu");
        assert_eq!(ExecutionProvider::CoreMl.to_string(), "coreml");
        assert_eq!(BackendType::Tract.to_string(), "tract");
    }
}
