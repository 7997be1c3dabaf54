//! Process-wide cache of initialized segmentation backends
//!
//! Loading segmentation weights dominates the cost of a local removal, so an
//! initialized backend is kept per model/backend/provider combination and
//! reused by every later call. Initialization for a key runs at most once at a
//! time; a failed initialization leaves the slot empty so the next call retries.

use crate::config::{BackendType, ExecutionProvider, LocalConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::{BackendFactory, SegmentationBackend};
use crate::models::ModelSource;
use instant::Duration;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OnceCell;

/// Initialized backend shared between callers
///
/// Inference needs `&mut self`, so concurrent users serialize on the inner lock.
/// The lock is only taken on the blocking thread pool.
pub type SharedBackend = Arc<Mutex<Box<dyn SegmentationBackend>>>;

/// Everything that changes what an initialized backend can do
///
/// External models are keyed by their canonical path; hub models also by the
/// hub and the cache directory their files come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendKey {
    pub source: ModelSource,
    pub variant: String,
    pub backend: BackendType,
    pub provider: ExecutionProvider,
    pub intra_threads: usize,
    pub cache_dir: Option<PathBuf>,
    pub hub_url: String,
}

impl BackendKey {
    #[must_use]
    pub fn from_config(config: &LocalConfig) -> Self {
        let source = match &config.model_spec.source {
            ModelSource::External(path) => ModelSource::External(
                std::fs::canonicalize(path).unwrap_or_else(|_| path.clone()),
            ),
            downloaded @ ModelSource::Downloaded(_) => downloaded.clone(),
        };
        Self {
            source,
            variant: config.model_spec.variant_or_default().to_string(),
            backend: config.backend_type,
            provider: config.execution_provider,
            intra_threads: config.intra_threads,
            cache_dir: config.cache_dir.clone(),
            hub_url: config.hub_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

#[derive(Default)]
pub struct BackendCache {
    entries: Mutex<HashMap<BackendKey, Arc<OnceCell<SharedBackend>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl std::fmt::Debug for BackendCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BackendCache {
    /// Create an empty cache, independent of the global one
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache used by default
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<BackendCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Get the backend for `config`, creating and initializing it on first use
    ///
    /// Returns the model load time when this call performed the initialization.
    ///
    /// # Errors
    /// - Backend creation or model resolution failures from `factory`
    /// - Backend initialization failures (unsupported device, invalid model)
    pub async fn get_or_init(
        &self,
        config: &LocalConfig,
        use_local_model_cache: bool,
        factory: &dyn BackendFactory,
    ) -> Result<(SharedBackend, Option<Duration>)> {
        let key = BackendKey::from_config(config);
        let cell = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| BgRemovalError::internal("Backend cache lock poisoned"))?;
            entries.entry(key.clone()).or_default().clone()
        };

        if let Some(backend) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Backend cache hit for {}", key.source.display_name());
            return Ok((backend.clone(), None));
        }

        let mut load_time = None;
        let slot = &mut load_time;
        let backend = cell
            .get_or_try_init(|| async move {
                log::debug!(
                    "Backend cache miss for {} ({}, {})",
                    key.source.display_name(),
                    key.backend,
                    key.provider
                );
                let mut backend = factory.create_backend(config, use_local_model_cache).await?;
                let init_config = config.clone();
                let (backend, elapsed) = tokio::task::spawn_blocking(move || {
                    let elapsed = backend.initialize(&init_config)?;
                    Ok::<_, BgRemovalError>((backend, elapsed))
                })
                .await
                .map_err(|e| {
                    BgRemovalError::internal(format!("Backend initialization task failed: {e}"))
                })??;
                *slot = elapsed;
                Ok::<_, BgRemovalError>(Arc::new(Mutex::new(backend)))
            })
            .await?
            .clone();

        if load_time.is_some() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            // Another caller finished initialization while we waited
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok((backend, load_time))
    }

    /// Drop every cached backend
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Number of keys holding an initialized backend
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|cell| cell.initialized()).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> BackendCacheStats {
        BackendCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
