//! On-disk model cache
//!
//! Hub models are stored under an XDG-style cache directory, one directory per
//! repository, mirroring the repository layout.

use crate::error::{BgRemovalError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "BGREMOVE_CACHE_DIR";

/// Information about a cached model
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// Model identifier (repository id with `/` replaced by `--`)
    pub model_id: String,
    /// Path to the cached model directory
    pub path: PathBuf,
    /// Whether `config.json` (class labels) is present
    pub has_config: bool,
    /// Available ONNX variants
    pub variants: Vec<String>,
    /// Size of the model directory in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache rooted at `$BGREMOVE_CACHE_DIR/models` or the user cache directory
    ///
    /// - Linux: `~/.cache/bgremove/models/`
    /// - macOS: `~/Library/Caches/bgremove/models/`
    /// - Windows: `%LOCALAPPDATA%/bgremove/models/`
    ///
    /// # Errors
    /// - Failed to determine or create the cache directory
    pub fn new() -> Result<Self> {
        let root = match std::env::var_os(CACHE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::cache_dir()
                .ok_or_else(|| {
                    BgRemovalError::invalid_config(format!(
                        "Failed to determine cache directory. Set {CACHE_DIR_ENV}."
                    ))
                })?
                .join("bgremove"),
        };
        Self::with_custom_cache_dir(&root)
    }

    /// Create a cache rooted at `cache_dir/models`
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        let models_dir = cache_dir.join("models");
        if !models_dir.exists() {
            fs::create_dir_all(&models_dir).map_err(|e| {
                BgRemovalError::file_io_error("create cache directory", &models_dir, &e)
            })?;
        }
        Ok(Self {
            cache_dir: models_dir,
        })
    }

    /// Filesystem-safe identifier for a hub repository
    ///
    /// # Examples
    /// ```
    /// use bgremove_fallback::cache::ModelCache;
    ///
    /// let id = ModelCache::repo_to_model_id("Xenova/segformer-b0-finetuned-ade-512-512");
    /// assert_eq!(id, "Xenova--segformer-b0-finetuned-ade-512-512");
    /// ```
    #[must_use]
    pub fn repo_to_model_id(repo: &str) -> String {
        repo.trim_matches('/').replace('/', "--")
    }

    /// Variant name for an ONNX file name, if it is a model file
    #[must_use]
    pub fn variant_from_file_name(file_name: &str) -> Option<String> {
        match file_name {
            "model.onnx" => Some("fp32".to_string()),
            other => other
                .strip_prefix("model_")
                .and_then(|s| s.strip_suffix(".onnx"))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    /// Whether the model directory holds a preprocessor config and at least one variant
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str) -> bool {
        let path = self.get_model_path(model_id);
        path.join("preprocessor_config.json").is_file() && !Self::scan_variants(&path).is_empty()
    }

    /// Whether a specific variant is cached
    #[must_use]
    pub fn has_variant(&self, model_id: &str, variant: &str) -> bool {
        self.is_model_cached(model_id)
            && self
                .get_model_path(model_id)
                .join(crate::models::variant_file_name(variant))
                .is_file()
    }

    /// Path to a model directory (may not exist)
    #[must_use]
    pub fn get_model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    fn scan_variants(model_path: &Path) -> Vec<String> {
        let Ok(entries) = fs::read_dir(model_path.join("onnx")) else {
            return Vec::new();
        };
        let mut variants: Vec<String> = entries
            .flatten()
            .filter_map(|entry| Self::variant_from_file_name(entry.file_name().to_str()?))
            .collect();
        variants.sort();
        variants
    }

    /// List all cached models, sorted by id
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            BgRemovalError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        let mut models = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(model_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Skip in-progress downloads
            if model_id.starts_with('.') || !self.is_model_cached(model_id) {
                log::debug!("Skipping non-model entry: {}", path.display());
                continue;
            }

            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                has_config: path.join("config.json").is_file(),
                variants: Self::scan_variants(&path),
                size_bytes: directory_size(&path).unwrap_or(0),
                path,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove one cached model; returns whether it existed
    ///
    /// # Errors
    /// - Failed to remove the model directory
    pub fn clear_specific_model(&self, model_id: &str) -> Result<bool> {
        let model_path = self.get_model_path(model_id);
        if !model_path.exists() {
            return Ok(false);
        }

        log::info!("Removing cached model: {model_id}");
        fs::remove_dir_all(&model_path).map_err(|e| {
            BgRemovalError::file_io_error("remove cached model directory", &model_path, &e)
        })?;
        Ok(true)
    }

    /// Remove every cached model, returning the removed ids
    ///
    /// # Errors
    /// - Failed to remove a model directory
    pub fn clear_all_models(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for model in self.scan_cached_models()? {
            if self.clear_specific_model(&model.model_id)? {
                removed.push(model.model_id);
            }
        }
        Ok(removed)
    }

    #[must_use]
    pub fn get_current_cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }
}

fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        total += if path.is_dir() {
            directory_size(&path)?
        } else {
            entry.metadata()?.len()
        };
    }
    Ok(total)
}

/// Format file size in human-readable format
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS.get(unit_index).unwrap_or(&"B");
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}
