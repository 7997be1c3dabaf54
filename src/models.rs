//! Model resolution and metadata
//!
//! Models follow the Hugging Face repository layout: `preprocessor_config.json`,
//! an optional `config.json` with `id2label`, and ONNX weights under `onnx/`.

use crate::cache::ModelCache;
use crate::config::LocalConfig;
use crate::error::{BgRemovalError, FailureCause, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default side length for bare `.onnx` files without a preprocessor config
const BARE_MODEL_INPUT_SIZE: u32 = 512;

/// `ImageNet` normalization used when no preprocessor config exists
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Model source specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSource {
    /// Model directory or bare `.onnx` file on the filesystem
    External(PathBuf),
    /// Hugging Face repository id, downloaded into the cache on demand
    Downloaded(String),
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::External(path) => {
                format!(
                    "external:{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )
            },
            ModelSource::Downloaded(repo) => format!("hub:{repo}"),
        }
    }
}

/// Complete model specification including source and optional variant
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelSpec {
    pub source: ModelSource,
    /// `fp32`, `fp16`, `quantized`, or any `model_<name>.onnx` suffix
    pub variant: Option<String>,
}

impl ModelSpec {
    /// Variant name with the fp32 default applied
    #[must_use]
    pub fn variant_or_default(&self) -> &str {
        self.variant.as_deref().unwrap_or("fp32")
    }
}

/// Relative path of the ONNX file for a variant
#[must_use]
pub fn variant_file_name(variant: &str) -> String {
    match variant {
        "fp32" => "onnx/model.onnx".to_string(),
        "fp16" => "onnx/model_fp16.onnx".to_string(),
        "quantized" => "onnx/model_quantized.onnx".to_string(),
        other => format!("onnx/model_{other}.onnx"),
    }
}

/// Model information and metadata
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub precision: String,
    pub size_bytes: usize,
    pub input_shape: (usize, usize, usize, usize), // NCHW format
    /// Class labels indexed by output channel
    pub labels: Vec<String>,
}

impl ModelInfo {
    /// Label for an output channel, falling back to `class_<index>`
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.labels
            .get(index)
            .filter(|l| !l.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("class_{index}"))
    }
}

/// Image preprocessing parameters for model input
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Model input size as `[height, width]`
    pub target_size: [u32; 2],
    /// Per-channel mean, applied after rescaling
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation, applied after rescaling
    pub normalization_std: [f32; 3],
    /// Multiplier applied to raw 0-255 pixel values, if any
    pub rescale_factor: Option<f32>,
    pub do_normalize: bool,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            target_size: [BARE_MODEL_INPUT_SIZE, BARE_MODEL_INPUT_SIZE],
            normalization_mean: IMAGENET_MEAN,
            normalization_std: IMAGENET_STD,
            rescale_factor: Some(1.0 / 255.0),
            do_normalize: true,
        }
    }
}

impl PreprocessingConfig {
    /// Parse a `preprocessor_config.json` document
    ///
    /// # Errors
    /// - Missing or malformed `size`, `image_mean` or `image_std`
    pub fn from_json(preprocessor: &serde_json::Value) -> Result<Self> {
        let target_size = parse_size(preprocessor)?;
        let do_normalize = preprocessor
            .get("do_normalize")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let do_rescale = preprocessor
            .get("do_rescale")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let rescale_factor = do_rescale.then(|| {
            preprocessor
                .get("rescale_factor")
                .and_then(serde_json::Value::as_f64)
                .map_or(1.0 / 255.0, |f| f as f32)
        });

        let (normalization_mean, normalization_std) = if do_normalize {
            (
                parse_triplet(preprocessor, "image_mean")?,
                parse_triplet(preprocessor, "image_std")?,
            )
        } else {
            ([0.0; 3], [1.0; 3])
        };

        if normalization_std.iter().any(|s| *s == 0.0) {
            return Err(model_error("image_std must not contain zeros"));
        }

        Ok(Self {
            target_size,
            normalization_mean,
            normalization_std,
            rescale_factor,
            do_normalize,
        })
    }
}

fn model_error<S: Into<String>>(msg: S) -> BgRemovalError {
    BgRemovalError::model_load(FailureCause::Other, msg)
}

/// `size` may be `{"height": h, "width": w}`, `{"shortest_edge": n}` or a bare integer
fn parse_size(preprocessor: &serde_json::Value) -> Result<[u32; 2]> {
    let size = preprocessor
        .get("size")
        .ok_or_else(|| model_error("Missing size in preprocessor config"))?;

    let to_u32 = |v: u64, what: &str| -> Result<u32> {
        u32::try_from(v)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| model_error(format!("Invalid {what} in size config: {v}")))
    };

    if let Some(edge) = size.as_u64() {
        let edge = to_u32(edge, "size")?;
        return Ok([edge, edge]);
    }
    if let Some(edge) = size.get("shortest_edge").and_then(serde_json::Value::as_u64) {
        let edge = to_u32(edge, "shortest_edge")?;
        return Ok([edge, edge]);
    }

    let height = size
        .get("height")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| model_error("Missing or invalid height in size config"))?;
    let width = size
        .get("width")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| model_error("Missing or invalid width in size config"))?;

    Ok([to_u32(height, "height")?, to_u32(width, "width")?])
}

fn parse_triplet(preprocessor: &serde_json::Value, key: &str) -> Result<[f32; 3]> {
    let values = preprocessor
        .get(key)
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| model_error(format!("Missing or invalid {key} in preprocessor config")))?;

    let parsed: Vec<f32> = values
        .iter()
        .filter_map(serde_json::Value::as_f64)
        .map(|v| v as f32)
        .collect();

    match parsed.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        [v] => Ok([*v, *v, *v]),
        _ => Err(model_error(format!("{key} must have 1 or 3 numeric values"))),
    }
}

/// Parse `id2label` from `config.json` into a dense label vector
fn parse_labels(config: &serde_json::Value) -> Vec<String> {
    let Some(map) = config.get("id2label").and_then(serde_json::Value::as_object) else {
        return Vec::new();
    };

    let mut entries: Vec<(usize, String)> = map
        .iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v.as_str()?.to_string())))
        .collect();
    entries.sort_by_key(|(index, _)| *index);

    let len = entries.last().map_or(0, |(index, _)| index + 1);
    let mut labels = vec![String::new(); len];
    for (index, label) in entries {
        if let Some(slot) = labels.get_mut(index) {
            *slot = label;
        }
    }
    labels
}

fn read_json(path: &Path, what: &str) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| BgRemovalError::file_io_error(&format!("read {what}"), path, &e))?;
    serde_json::from_str(&content).map_err(|e| model_error(format!("Failed to parse {what}: {e}")))
}

/// Resolved on-disk model files
#[derive(Debug, Clone)]
pub struct ModelManager {
    name: String,
    variant: String,
    model_file: PathBuf,
    preprocessing: PreprocessingConfig,
    labels: Vec<String>,
}

impl ModelManager {
    /// Build a manager from a model directory following the hub layout
    ///
    /// # Errors
    /// - Missing or malformed `preprocessor_config.json`
    /// - Requested variant's ONNX file not present
    pub fn from_directory<P: AsRef<Path>>(dir: P, variant: &str, name: String) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(model_error(format!(
                "Model directory does not exist: {}",
                dir.display()
            )));
        }

        let preprocessor = read_json(
            &dir.join("preprocessor_config.json"),
            "preprocessor_config.json",
        )?;
        let preprocessing = PreprocessingConfig::from_json(&preprocessor)?;

        let config_path = dir.join("config.json");
        let labels = if config_path.exists() {
            parse_labels(&read_json(&config_path, "config.json")?)
        } else {
            Vec::new()
        };

        let model_file = dir.join(variant_file_name(variant));
        if !model_file.is_file() {
            return Err(model_error(format!(
                "Variant '{variant}' not found: {}",
                model_file.display()
            )));
        }

        Ok(Self {
            name,
            variant: variant.to_string(),
            model_file,
            preprocessing,
            labels,
        })
    }

    /// Build a manager for a bare `.onnx` file with default preprocessing
    ///
    /// # Errors
    /// - File does not exist or is not an `.onnx` file
    pub fn from_onnx_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_onnx = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
        if !path.is_file() || !is_onnx {
            return Err(model_error(format!(
                "Expected an .onnx model file: {}",
                path.display()
            )));
        }

        Ok(Self {
            name: path
                .file_stem()
                .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned()),
            variant: "fp32".to_string(),
            model_file: path.to_path_buf(),
            preprocessing: PreprocessingConfig::default(),
            labels: Vec::new(),
        })
    }

    /// Resolve a spec against files already on disk
    ///
    /// # Errors
    /// - External path missing or malformed
    /// - Downloaded model not present in `cache`
    pub fn from_spec(spec: &ModelSpec, cache: &ModelCache) -> Result<Self> {
        let variant = spec.variant_or_default();
        match &spec.source {
            ModelSource::External(path) if path.is_file() => Self::from_onnx_file(path),
            ModelSource::External(path) => {
                Self::from_directory(path, variant, spec.source.display_name())
            },
            ModelSource::Downloaded(repo) => {
                let model_id = ModelCache::repo_to_model_id(repo);
                if !cache.has_variant(&model_id, variant) {
                    return Err(model_error(format!(
                        "Model '{repo}' ({variant}) is not in the cache at {}",
                        cache.get_current_cache_dir().display()
                    )));
                }
                Self::from_directory(cache.get_model_path(&model_id), variant, repo.clone())
            },
        }
    }

    /// Resolve a spec, downloading hub models into the cache when needed
    ///
    /// With `use_local_model_cache == false`, cached files are ignored and fetched again.
    ///
    /// # Errors
    /// - Download failures
    /// - Any error from [`ModelManager::from_spec`]
    pub async fn resolve(config: &LocalConfig, use_local_model_cache: bool) -> Result<Self> {
        let cache = match &config.cache_dir {
            Some(dir) => ModelCache::with_custom_cache_dir(dir)?,
            None => ModelCache::new()?,
        };

        if let ModelSource::Downloaded(repo) = &config.model_spec.source {
            let downloader = crate::download::ModelDownloader::new(
                cache.clone(),
                &config.hub_url,
                config.download_timeout,
            )?;
            downloader
                .download_model(
                    repo,
                    config.model_spec.variant_or_default(),
                    !use_local_model_cache,
                    false,
                )
                .await?;
        }

        let spec = config.model_spec.clone();
        tokio::task::spawn_blocking(move || Self::from_spec(&spec, &cache))
            .await
            .map_err(|e| BgRemovalError::internal(format!("Model resolution task failed: {e}")))?
    }

    /// Read the model weights
    ///
    /// # Errors
    /// - File system errors
    pub fn load_model(&self) -> Result<Vec<u8>> {
        fs::read(&self.model_file).map_err(|e| {
            BgRemovalError::file_io_error("read model file", &self.model_file, &e)
        })
    }

    /// Model metadata, reading the file size from disk
    ///
    /// # Errors
    /// - Model file metadata unavailable
    pub fn get_info(&self) -> Result<ModelInfo> {
        let size_bytes = fs::metadata(&self.model_file)
            .map_err(|e| BgRemovalError::file_io_error("stat model file", &self.model_file, &e))?
            .len() as usize;
        let [height, width] = self.preprocessing.target_size;

        Ok(ModelInfo {
            name: self.name.clone(),
            precision: self.variant.clone(),
            size_bytes,
            input_shape: (1, 3, height as usize, width as usize),
            labels: self.labels.clone(),
        })
    }

    #[must_use]
    pub fn get_preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing.clone()
    }

    #[must_use]
    pub fn get_model_path(&self) -> &Path {
        &self.model_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_model_dir(dir: &Path, preprocessor: &str, config: Option<&str>, variants: &[&str]) {
        fs::create_dir_all(dir.join("onnx")).unwrap();
        fs::write(dir.join("preprocessor_config.json"), preprocessor).unwrap();
        if let Some(config) = config {
            fs::write(dir.join("config.json"), config).unwrap();
        }
        for variant in variants {
            fs::write(dir.join(variant_file_name(variant)), b"onnx-bytes").unwrap();
        }
    }

    const SEGFORMER_PREPROCESSOR: &str = r#"{
        "do_normalize": true,
        "do_rescale": true,
        "rescale_factor": 0.00392156862745098,
        "image_mean": [0.485, 0.456, 0.406],
        "image_std": [0.229, 0.224, 0.225],
        "size": {"height": 512, "width": 512}
    }"#;

    #[test]
    fn test_variant_file_names() {
        assert_eq!(variant_file_name("fp32"), "onnx/model.onnx");
        assert_eq!(variant_file_name("fp16"), "onnx/model_fp16.onnx");
        assert_eq!(variant_file_name("quantized"), "onnx/model_quantized.onnx");
        assert_eq!(variant_file_name("int8"), "onnx/model_int8.onnx");
    }

    #[test]
    fn test_model_source_display_name() {
        let source = ModelSource::Downloaded("Xenova/segformer".to_string());
        assert_eq!(source.display_name(), "hub:Xenova/segformer");
        let source = ModelSource::External(PathBuf::from("/models/my-model"));
        assert_eq!(source.display_name(), "external:my-model");
    }

    #[test]
    fn test_preprocessing_from_json() {
        let json: serde_json::Value = serde_json::from_str(SEGFORMER_PREPROCESSOR).unwrap();
        let config = PreprocessingConfig::from_json(&json).unwrap();
        assert_eq!(config.target_size, [512, 512]);
        assert_eq!(config.normalization_mean, IMAGENET_MEAN);
        assert!(config.do_normalize);
        assert!((config.rescale_factor.unwrap() - 1.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocessing_size_forms() {
        let json = serde_json::json!({"size": 320, "do_normalize": false});
        let config = PreprocessingConfig::from_json(&json).unwrap();
        assert_eq!(config.target_size, [320, 320]);
        assert_eq!(config.normalization_std, [1.0; 3]);

        let json = serde_json::json!({"size": {"shortest_edge": 256}, "do_normalize": false});
        assert_eq!(
            PreprocessingConfig::from_json(&json).unwrap().target_size,
            [256, 256]
        );

        let json = serde_json::json!({"size": {"height": 0, "width": 10}});
        assert!(PreprocessingConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_labels_are_dense_and_ordered() {
        let config = serde_json::json!({"id2label": {"2": "sky", "0": "wall", "1": "building"}});
        assert_eq!(parse_labels(&config), vec!["wall", "building", "sky"]);
        assert!(parse_labels(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_manager_from_directory() {
        let temp = TempDir::new().unwrap();
        write_model_dir(
            temp.path(),
            SEGFORMER_PREPROCESSOR,
            Some(r#"{"id2label": {"0": "wall", "1": "person"}}"#),
            &["fp32", "quantized"],
        );

        let manager = ModelManager::from_directory(temp.path(), "quantized", "test".into()).unwrap();
        let info = manager.get_info().unwrap();
        assert_eq!(info.precision, "quantized");
        assert_eq!(info.input_shape, (1, 3, 512, 512));
        assert_eq!(info.label(1), "person");
        assert_eq!(info.label(9), "class_9");
        assert_eq!(manager.load_model().unwrap(), b"onnx-bytes");

        let err = ModelManager::from_directory(temp.path(), "fp16", "test".into()).unwrap_err();
        assert!(err.to_string().contains("fp16"));
    }

    #[test]
    fn test_manager_from_bare_onnx_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.onnx");
        fs::write(&path, b"weights").unwrap();

        let spec = ModelSpec {
            source: ModelSource::External(path),
            variant: None,
        };
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let manager = ModelManager::from_spec(&spec, &cache).unwrap();
        assert_eq!(manager.get_preprocessing_config(), PreprocessingConfig::default());
        assert_eq!(manager.get_info().unwrap().name, "custom");
    }

    #[test]
    fn test_missing_downloaded_model() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let spec = ModelSpec {
            source: ModelSource::Downloaded("nobody/nothing".to_string()),
            variant: None,
        };
        let err = ModelManager::from_spec(&spec, &cache).unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad { .. }));
    }
}
