//! Conversion of CLI arguments into a pipeline configuration

use crate::cli::main_impl::{Cli, CliBackend, CliMaskPolarity, CliProvider};
use crate::{
    config::{BackendType, ExecutionProvider, MaskPolarity, PipelineConfig},
    models::{ModelSource, ModelSpec},
};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the pipeline configuration from parsed arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<PipelineConfig> {
        let mut builder = PipelineConfig::builder()
            .use_local_model_cache(!cli.no_model_cache)
            .max_dimension(cli.max_dimension)
            .remote_timeout(Duration::from_secs(cli.timeout_secs))
            .model_spec(Self::model_spec(cli))
            .backend_type(match cli.backend {
                CliBackend::Onnx => BackendType::Onnx,
                CliBackend::Tract => BackendType::Tract,
            })
            .execution_provider(match cli.execution_provider {
                CliProvider::Cpu => ExecutionProvider::Cpu,
                CliProvider::Cuda => ExecutionProvider::Cuda,
                CliProvider::Coreml => ExecutionProvider::CoreMl,
            })
            .mask_polarity(match cli.mask_polarity {
                CliMaskPolarity::Background => MaskPolarity::Background,
                CliMaskPolarity::Foreground => MaskPolarity::Foreground,
            })
            .intra_threads(cli.threads);

        if let Some(key) = &cli.api_key {
            builder = builder.default_credential(key.as_str());
        }
        if let Some(endpoint) = &cli.endpoint {
            builder = builder.remote_endpoint(endpoint.as_str());
        }
        if let Some(dir) = &cli.cache_dir {
            builder = builder.cache_dir(dir.clone());
        }

        builder.build().context("Invalid configuration")
    }

    /// An existing path is an external model, anything else a hub repository
    pub(crate) fn model_spec(cli: &Cli) -> ModelSpec {
        let source = match &cli.model {
            Some(model) if Path::new(model).exists() => ModelSource::External(model.into()),
            Some(repo) => ModelSource::Downloaded(repo.clone()),
            None => ModelSource::Downloaded(crate::config::DEFAULT_MODEL_ID.to_string()),
        };
        ModelSpec {
            source,
            variant: cli.variant.clone(),
        }
    }
}
