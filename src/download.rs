//! Model downloading from Hugging Face style hubs
//!
//! Files are streamed into a staging directory inside the cache and moved into
//! place only after every required file arrived. A `manifest.json` records the
//! SHA-256 of each file so later runs can detect corrupted caches.

use crate::cache::ModelCache;
use crate::error::{BgRemovalError, FailureCause, Result};
use crate::models::variant_file_name;
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// Integrity manifest file name inside each model directory
pub const MANIFEST_FILE: &str = "manifest.json";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    fn create(show_progress: bool) -> Self {
        #[cfg(feature = "cli")]
        {
            if show_progress {
                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                return Self::Indicatif(pb);
            }
        }
        let _ = show_progress;
        Self::NoOp
    }

    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => drop(msg),
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {},
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {},
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => drop(msg),
        }
    }
}

/// Staging directory removed on drop unless committed
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(cache: &ModelCache, model_id: &str) -> Result<Self> {
        let path = cache.get_current_cache_dir().join(format!(
            ".tmp-{model_id}-{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&path)
            .map_err(|e| BgRemovalError::file_io_error("create staging directory", &path, &e))?;
        Ok(Self { path })
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                log::warn!("Failed to clean up {}: {e}", self.path.display());
            }
        }
    }
}

/// Model downloader with progress reporting
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
    hub_url: String,
}

impl ModelDownloader {
    /// Create a downloader for `hub_url` writing into `cache`
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache, hub_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BgRemovalError::network("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            cache,
            hub_url: hub_url.trim_end_matches('/').to_string(),
        })
    }

    /// Ensure `repo`'s `variant` is in the cache, downloading what is missing
    ///
    /// Returns the cache model id. With `force`, cached files are fetched again.
    ///
    /// # Errors
    /// - Network or HTTP errors for required files
    /// - File system errors during staging or commit
    pub async fn download_model(
        &self,
        repo: &str,
        variant: &str,
        force: bool,
        show_progress: bool,
    ) -> Result<String> {
        let model_id = ModelCache::repo_to_model_id(repo);

        if !force && self.cache.has_variant(&model_id, variant) {
            let dir = self.cache.get_model_path(&model_id);
            let verified = tokio::task::spawn_blocking(move || verify_model_dir(&dir))
                .await
                .map_err(|e| BgRemovalError::internal(format!("Cache verification task failed: {e}")))?;
            match verified {
                Ok(true) => {
                    log::debug!("Model already cached: {model_id} ({variant})");
                    return Ok(model_id);
                },
                Ok(false) => log::warn!("Cached model {model_id} failed integrity check"),
                Err(e) => log::warn!("Could not verify cached model {model_id}: {e}"),
            }
        }

        log::info!("Downloading {repo} ({variant}) from {}", self.hub_url);
        let progress = ProgressIndicator::create(show_progress);
        let staging = StagingDir::create(&self.cache, &model_id)?;

        let result = match self
            .download_files(repo, variant, &staging.path, &progress)
            .await
        {
            Ok(hashes) => {
                let final_dir = self.cache.get_model_path(&model_id);
                let staged = staging.path.clone();
                tokio::task::spawn_blocking(move || commit(&final_dir, &staged, &hashes))
                    .await
                    .map_err(|e| BgRemovalError::internal(format!("Cache commit task failed: {e}")))?
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                progress.finish_with_message(format!("Downloaded {model_id}"));
                log::info!("Cached model {model_id} ({variant})");
            },
            Err(e) => {
                progress.finish_with_message("Download failed".to_string());
                log::warn!("Download of {repo} failed: {e}");
            },
        }
        result.map(|()| model_id)
    }

    async fn download_files(
        &self,
        repo: &str,
        variant: &str,
        staging: &Path,
        progress: &ProgressIndicator,
    ) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();
        let weights = variant_file_name(variant);

        for (file, required) in [
            ("preprocessor_config.json", true),
            ("config.json", false),
            (weights.as_str(), true),
        ] {
            progress.set_message(format!("Downloading {file}"));
            let url = format!("{}/{}/resolve/main/{}", self.hub_url, repo, file);
            match self.download_file(&url, &staging.join(file), progress).await? {
                Some(hash) => {
                    hashes.insert(file.to_string(), hash);
                },
                None if required => {
                    return Err(BgRemovalError::model_load(
                        FailureCause::Other,
                        format!("Required file {file} not found in {repo}"),
                    ));
                },
                None => log::debug!("Optional file {file} not present in {repo}"),
            }
        }

        Ok(hashes)
    }

    /// Stream one file to disk, returning its SHA-256, or `None` on 404
    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<Option<String>> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create directory", parent, &e))?;
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            BgRemovalError::model_load(FailureCause::Other, format!("Failed to download {url}: {e}"))
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BgRemovalError::model_load(
                FailureCause::Other,
                format!("HTTP error {} for {url}", response.status()),
            ));
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = stream.read(&mut buffer).await.map_err(|e| {
                BgRemovalError::model_load(
                    FailureCause::Other,
                    format!("Failed to read download stream for {url}: {e}"),
                )
            })?;
            if bytes_read == 0 {
                break;
            }

            let chunk = buffer.get(..bytes_read).unwrap_or(&[]);
            hasher.update(chunk);
            file.write_all(chunk)
                .await
                .map_err(|e| BgRemovalError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            progress.set_position(downloaded);
        }

        file.flush()
            .await
            .map_err(|e| BgRemovalError::file_io_error("flush file", local_path, &e))?;

        if let Some(total) = total_size {
            if total != downloaded {
                return Err(BgRemovalError::model_load(
                    FailureCause::Other,
                    format!("Incomplete download of {url}: {downloaded} of {total} bytes"),
                ));
            }
        }

        log::debug!("Downloaded {downloaded} bytes to {}", local_path.display());
        Ok(Some(format!("{:x}", hasher.finalize())))
    }

    /// Check every file listed in the model's manifest
    ///
    /// Models without a manifest (copied in by hand) are trusted.
    ///
    /// # Errors
    /// - Manifest unreadable, or a listed file unreadable
    pub fn verify_cached_model(&self, model_id: &str) -> Result<bool> {
        verify_model_dir(&self.cache.get_model_path(model_id))
    }
}

/// Move staged files into `final_dir` and merge the manifest
fn commit(final_dir: &Path, staging: &Path, hashes: &BTreeMap<String, String>) -> Result<()> {
    let mut manifest = read_manifest(final_dir).unwrap_or_default();

    for (file, hash) in hashes {
        let from = staging.join(file);
        let to = final_dir.join(file);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create directory", parent, &e))?;
        }
        fs::rename(&from, &to).map_err(|e| {
            BgRemovalError::file_io_error("move downloaded file into cache", &to, &e)
        })?;
        manifest.insert(file.clone(), hash.clone());
    }

    let manifest_path = final_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| BgRemovalError::internal(format!("Failed to serialize manifest: {e}")))?;
    fs::write(&manifest_path, json)
        .map_err(|e| BgRemovalError::file_io_error("write manifest", &manifest_path, &e))
}

/// Hash-check every file listed in `dir`'s manifest; no manifest means trusted
fn verify_model_dir(dir: &Path) -> Result<bool> {
    if !dir.join(MANIFEST_FILE).exists() {
        return Ok(true);
    }
    let manifest = read_manifest(dir)?;
    for (file, hash) in &manifest {
        if !verify_file_integrity(&dir.join(file), Some(hash))? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_manifest(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|e| BgRemovalError::file_io_error("read manifest", &path, &e))?;
    serde_json::from_str(&content).map_err(|e| {
        BgRemovalError::model_load(FailureCause::Other, format!("Corrupt manifest: {e}"))
    })
}

/// Verify a file against an expected SHA-256 hex digest
///
/// # Errors
/// - File unreadable
pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_hash else {
        return Ok(true);
    };
    if !file_path.exists() {
        return Ok(false);
    }

    let contents = fs::read(file_path).map_err(|e| {
        BgRemovalError::file_io_error("read file for verification", file_path, &e)
    })?;
    let actual = format!("{:x}", Sha256::digest(&contents));
    Ok(actual.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_verify_file_integrity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.bin");
        fs::write(&path, b"hello").unwrap();

        let hash = format!("{:x}", Sha256::digest(b"hello"));
        assert!(verify_file_integrity(&path, Some(&hash)).unwrap());
        assert!(verify_file_integrity(&path, Some(&hash.to_uppercase())).unwrap());
        assert!(!verify_file_integrity(&path, Some("00")).unwrap());
        assert!(verify_file_integrity(&path, None).unwrap());
        assert!(!verify_file_integrity(&temp.path().join("missing"), Some(&hash)).unwrap());
    }

    #[test]
    fn test_staging_dir_cleaned_on_drop() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let path = {
            let staging = StagingDir::create(&cache, "org--model").unwrap();
            fs::write(staging.path.join("partial"), b"x").unwrap();
            staging.path.clone()
        };
        assert!(!path.exists());
    }

    /// Commit a two-file model as `org--model`
    fn commit_fixture(cache: &ModelCache) {
        let staging = StagingDir::create(cache, "org--model").unwrap();
        fs::create_dir_all(staging.path.join("onnx")).unwrap();
        fs::write(staging.path.join("preprocessor_config.json"), b"{}").unwrap();
        fs::write(staging.path.join("onnx/model.onnx"), b"weights").unwrap();

        let mut hashes = BTreeMap::new();
        hashes.insert(
            "preprocessor_config.json".to_string(),
            format!("{:x}", Sha256::digest(b"{}")),
        );
        hashes.insert(
            "onnx/model.onnx".to_string(),
            format!("{:x}", Sha256::digest(b"weights")),
        );
        commit(&cache.get_model_path("org--model"), &staging.path, &hashes).unwrap();
    }

    #[test]
    fn test_commit_and_verify() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let downloader =
            ModelDownloader::new(cache.clone(), "http://127.0.0.1:1", Duration::from_secs(1))
                .unwrap();

        commit_fixture(&cache);

        assert!(cache.has_variant("org--model", "fp32"));
        assert!(downloader.verify_cached_model("org--model").unwrap());

        fs::write(cache.get_model_path("org--model").join("onnx/model.onnx"), b"tampered")
            .unwrap();
        assert!(!downloader.verify_cached_model("org--model").unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cached_model_is_verified_before_reuse() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        // Unreachable hub: any download attempt fails
        let downloader =
            ModelDownloader::new(cache.clone(), "http://127.0.0.1:1", Duration::from_secs(1))
                .unwrap();

        commit_fixture(&cache);

        let model_id = downloader
            .download_model("org/model", "fp32", false, false)
            .await
            .unwrap();
        assert_eq!(model_id, "org--model");

        fs::write(cache.get_model_path("org--model").join("onnx/model.onnx"), b"tampered")
            .unwrap();
        let err = downloader
            .download_model("org/model", "fp32", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad { .. }), "got {err:?}");
    }
}
