#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Background removal with a local fallback
//!
//! Removes the background of a single image. The remove.bg API is tried first;
//! if it fails for any reason the image is segmented locally with a segformer
//! model and the background is made transparent.
//!
//! ## Pipeline
//!
//! 1. The input is decoded once ([`ImageLoader`]).
//! 2. [`RemoteRemovalStrategy`] uploads the original bytes with the API key.
//! 3. On failure, [`LocalInferenceStrategy`] bounds the image to 1024 pixels,
//!    runs the model on CPU and writes `alpha = 1 - mask` into a PNG.
//! 4. [`RemovalOrchestrator`] runs the steps above, allows at most one local
//!    attempt per call and at most two unresolved calls per image.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgremove_fallback::{PipelineConfig, RemovalOrchestrator, SourceFile};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::builder()
//!     .default_credential("my-remove-bg-key")
//!     .build()?;
//! let orchestrator = RemovalOrchestrator::new(config)?;
//!
//! let file = SourceFile::from_path("portrait.jpg")?;
//! let output = orchestrator.remove(&file, None).await?;
//! output.save(format!("portrait-nobg.{}", output.extension()))?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): `bgremove` binary, progress spinner and tracing setup
//! - `webp-support` (default): WebP input
//! - `tracing-json`, `tracing-files`: extra tracing outputs for the CLI

pub mod backends;
pub mod cache;
pub mod canvas;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositing;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod loader;
pub mod local;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod services;
pub mod session_cache;
pub mod strategy;
pub mod tracing_config;
pub mod types;
pub mod utils;

pub use backends::*;
pub use cache::{format_size, CachedModelInfo, ModelCache};
pub use canvas::Resizer;
pub use config::{
    BackendType, ExecutionProvider, LocalConfig, MaskPolarity, PipelineConfig,
    PipelineConfigBuilder, RemoteConfig,
};
pub use download::ModelDownloader;
pub use error::{BgRemovalError, FailureCause, Result};
pub use inference::{BackendFactory, DefaultBackendFactory, SegmentationBackend};
pub use loader::ImageLoader;
pub use local::LocalInferenceStrategy;
pub use models::{ModelInfo, ModelManager, ModelSource, ModelSpec};
pub use orchestrator::{PipelineState, RemovalOrchestrator};
pub use remote::RemoteRemovalStrategy;
pub use services::{
    ConsoleProgressReporter, NoOpProgressReporter, ProcessingStage, ProgressReporter,
    ProgressTracker, ProgressUpdate,
};
pub use session_cache::{BackendCache, BackendCacheStats, BackendKey, SharedBackend};
pub use strategy::{RemovalRequest, RemovalStrategy};
pub use types::{
    BoundedCanvas, Credential, OutputImage, ProcessingMetadata, ProcessingTimings, Segment,
    SegmentationMask, SourceDigest, SourceFile, SourceImage, StrategyKind,
};

pub use tracing_config::spans;
#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};

/// Remove the background of one image with a throwaway orchestrator
///
/// Convenient for one-off calls. Long-lived callers should keep a
/// [`RemovalOrchestrator`] so the attempt ceiling spans calls; loaded local
/// models are shared either way.
///
/// # Examples
///
/// ```rust,no_run
/// use bgremove_fallback::{remove_background, PipelineConfig, SourceFile};
///
/// # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
/// let file = SourceFile::new(upload, "upload.jpg");
/// let output = remove_background(&file, Some("my-key"), PipelineConfig::default()).await?;
/// assert!(!output.bytes.is_empty());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// - [`BgRemovalError::Decode`] when the input is not an image
/// - [`BgRemovalError::UnsupportedDevice`], [`BgRemovalError::ResourceExhausted`]
///   or [`BgRemovalError::ProcessingFailed`] when both strategies fail
pub async fn remove_background(
    file: &SourceFile,
    credential: Option<&str>,
    config: PipelineConfig,
) -> Result<OutputImage> {
    RemovalOrchestrator::new(config)?.remove(file, credential).await
}
