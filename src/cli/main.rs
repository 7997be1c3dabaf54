//! Background removal CLI
//!
//! Removes the background of one image: remote service first, local model as
//! fallback.

use super::config::CliConfigBuilder;
use crate::{
    cache::{format_size, ModelCache},
    config::PipelineConfig,
    download::ModelDownloader,
    error::BgRemovalError,
    models::ModelSource,
    orchestrator::RemovalOrchestrator,
    services::{ProcessingStage, ProgressReporter, ProgressUpdate},
    tracing_config::{init_cli_tracing, spans},
    types::{OutputImage, ProcessingTimings, SourceFile},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Remove image backgrounds with remove.bg, falling back to a local model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input image file (use "-" for stdin)
    #[arg(
        value_name = "INPUT",
        required_unless_present_any = ["show_providers", "download_only", "list_models", "clear_cache"]
    )]
    pub input: Option<String>,

    /// Output file. Use "-" for stdout [default: <input>-nobg.<ext>]
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<String>,

    /// remove.bg API key
    #[arg(long, env = "REMOVE_BG_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Remote endpoint [default: https://api.remove.bg/v1.0/removebg]
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Remote request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Largest image side used for local inference
    #[arg(long, default_value_t = crate::config::MAX_IMAGE_DIMENSION)]
    pub max_dimension: u32,

    /// Model repository on the hub, or path to a model directory / .onnx file
    #[arg(short, long)]
    pub model: Option<String>,

    /// Model variant (fp32, fp16, quantized) [default: fp32]
    #[arg(long)]
    pub variant: Option<String>,

    /// Local inference backend
    #[arg(long, value_enum, default_value_t = CliBackend::default())]
    pub backend: CliBackend,

    /// Execution provider for local inference
    #[arg(short, long, value_enum, default_value_t = CliProvider::Cpu)]
    pub execution_provider: CliProvider,

    /// Meaning of the model's mask
    #[arg(long, value_enum, default_value_t = CliMaskPolarity::Background)]
    pub mask_polarity: CliMaskPolarity,

    /// Number of inference threads (0 = auto)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Download model files again even if they are cached
    #[arg(long)]
    pub no_model_cache: bool,

    /// Use custom cache directory
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Download the model and exit
    #[arg(long)]
    pub download_only: bool,

    /// List cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Clear cached models (combine with --model to clear one model) and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Show execution provider availability and exit
    #[arg(long)]
    pub show_providers: bool,

    /// Verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliBackend {
    Onnx,
    Tract,
}

impl Default for CliBackend {
    fn default() -> Self {
        match crate::config::BackendType::default() {
            crate::config::BackendType::Onnx => Self::Onnx,
            crate::config::BackendType::Tract => Self::Tract,
        }
    }
}

impl std::fmt::Display for CliBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Onnx => "onnx",
            Self::Tract => "tract",
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliProvider {
    Cpu,
    Cuda,
    Coreml,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliMaskPolarity {
    /// Mask is the background probability
    Background,
    /// Mask is the foreground probability
    Foreground,
}

/// Drives an indicatif spinner from pipeline stages
struct SpinnerReporter {
    bar: ProgressBar,
}

impl SpinnerReporter {
    fn new() -> Self {
        let bar = if io::stderr().is_terminal() {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressReporter for SpinnerReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        self.bar.set_message(update.description);
    }

    fn report_completion(&self, timings: ProcessingTimings) {
        self.bar.finish_and_clear();
        tracing::debug!(
            decode_ms = timings.image_decode_ms,
            remote_ms = ?timings.remote_ms,
            model_load_ms = ?timings.model_load_ms,
            inference_ms = timings.inference_ms,
            total_ms = timings.total_ms,
            "Timings"
        );
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        self.bar.finish_and_clear();
        tracing::debug!(stage = ?stage, "{error}");
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let session_id = init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    if cli.list_models {
        return list_cached_models(&cli);
    }

    if cli.clear_cache {
        return clear_cache_models(&cli);
    }

    let config = CliConfigBuilder::from_cli(&cli)?;

    if cli.download_only {
        return download_model_only(&config).await;
    }

    let input = cli
        .input
        .as_deref()
        .context("An input image is required")?;

    let span = spans::session(
        &session_id,
        &config.local.model_spec.source.display_name(),
        &config.local.execution_provider.to_string(),
    );
    process_input(&cli, config, input).instrument(span).await
}

async fn process_input(cli: &Cli, config: PipelineConfig, input: &str) -> Result<()> {
    let file = if input == "-" {
        SourceFile::new(read_stdin()?, "stdin")
    } else {
        SourceFile::from_path(input).with_context(|| format!("Failed to read {input}"))?
    };

    let orchestrator = RemovalOrchestrator::new(config)
        .context("Failed to create background removal pipeline")?
        .with_progress_reporter(Arc::new(SpinnerReporter::new()));

    let output = match orchestrator.remove(&file, None).await {
        Ok(output) => output,
        Err(err) => {
            tracing::debug!("Background removal failed: {err:?}");
            return Err(removal_failure(&err));
        },
    };

    tracing::info!(
        "Background removed via {} ({} bytes{})",
        output.strategy,
        output.bytes.len(),
        output
            .dimensions
            .map(|(w, h)| format!(", {w}x{h}"))
            .unwrap_or_default()
    );

    match output_target(cli.output.as_deref(), input, &output) {
        None => write_stdout(&output.bytes),
        Some(path) => {
            output
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Saved {}", path.display());
            Ok(())
        },
    }
}

/// The single line reported for a failed removal
fn removal_failure(err: &BgRemovalError) -> anyhow::Error {
    anyhow::anyhow!(err.user_message())
}

/// `None` means stdout
fn output_target(output: Option<&str>, input: &str, image: &OutputImage) -> Option<PathBuf> {
    match output {
        Some("-") => None,
        Some(path) => Some(PathBuf::from(path)),
        None if input == "-" => None,
        None => Some(default_output_path(Path::new(input), image.extension())),
    }
}

fn default_output_path(input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(|| "output".to_string(), |s| s.to_string_lossy().into_owned());
    input.with_file_name(format!("{stem}-nobg.{extension}"))
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    io::stdin()
        .read_to_end(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(data).context("Failed to write to stdout")?;
    stdout.flush().context("Failed to flush stdout")
}

fn show_provider_diagnostics() {
    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    println!("System: {cpu_count} CPU cores detected");

    #[cfg(feature = "onnx")]
    {
        println!("\nonnx backend:");
        for (name, available, description) in crate::backends::OnnxBackend::list_providers() {
            let status = if available { "available" } else { "not available" };
            println!("  {name}: {status} - {description}");
        }
    }

    #[cfg(feature = "tract")]
    {
        println!("\ntract backend:");
        for (name, available, description) in crate::backends::TractBackend::list_providers() {
            let status = if available { "available" } else { "not available" };
            println!("  {name}: {status} - {description}");
        }
    }

    println!("\nCPU is the default. Accelerators are only used when requested with --execution-provider.");
}

fn open_cache(cli: &Cli) -> Result<ModelCache> {
    match &cli.cache_dir {
        Some(dir) => ModelCache::with_custom_cache_dir(dir)
            .context("Failed to create cache with custom directory"),
        None => ModelCache::new().context("Failed to create model cache"),
    }
}

fn list_cached_models(cli: &Cli) -> Result<()> {
    let cache = open_cache(cli)?;
    let models = cache
        .scan_cached_models()
        .context("Failed to list cached models")?;

    println!("Cached models in {}", cache.get_current_cache_dir().display());

    if models.is_empty() {
        println!("No cached models found.");
        println!("Download the default model with: bgremove --download-only");
        return Ok(());
    }

    for model in models {
        println!("{}", model.model_id);
        println!("  location: {}", model.path.display());
        if !model.variants.is_empty() {
            println!("  variants: {}", model.variants.join(", "));
        }
        println!("  size: {}", format_size(model.size_bytes));
        if !model.has_config {
            println!("  labels: missing config.json, classes are unnamed");
        }
    }

    Ok(())
}

fn clear_cache_models(cli: &Cli) -> Result<()> {
    let cache = open_cache(cli)?;

    if let Some(model) = &cli.model {
        let model_id = ModelCache::repo_to_model_id(model);
        if cache
            .clear_specific_model(&model_id)
            .with_context(|| format!("Failed to clear model '{model}'"))?
        {
            println!("Removed {model} from {}", cache.get_current_cache_dir().display());
        } else {
            println!("Model '{model}' not found in cache. Use --list-models to see cached models.");
        }
    } else {
        let removed = cache.clear_all_models().context("Failed to clear cache")?;
        if removed.is_empty() {
            println!("Cache was already empty");
        } else {
            println!("Removed {} model(s):", removed.len());
            for model_id in &removed {
                println!("  {model_id}");
            }
        }
    }

    Ok(())
}

async fn download_model_only(config: &PipelineConfig) -> Result<()> {
    let local = &config.local;
    let ModelSource::Downloaded(repo) = &local.model_spec.source else {
        println!(
            "{} is a local model, nothing to download",
            local.model_spec.source.display_name()
        );
        return Ok(());
    };
    let variant = local.model_spec.variant_or_default();

    let cache = match &local.cache_dir {
        Some(dir) => ModelCache::with_custom_cache_dir(dir)?,
        None => ModelCache::new()?,
    };
    let downloader = ModelDownloader::new(cache.clone(), &local.hub_url, local.download_timeout)
        .context("Failed to create model downloader")?;

    let model_id = downloader
        .download_model(repo, variant, !config.use_local_model_cache, true)
        .instrument(spans::download(repo, variant))
        .await
        .with_context(|| format!("Failed to download {repo}"))?;

    println!(
        "Model {repo} ({variant}) ready at {}",
        cache.get_model_path(&model_id).display()
    );
    Ok(())
}
