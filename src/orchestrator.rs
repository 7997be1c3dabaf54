//! Remote-first removal with a single local fallback
//!
//! The orchestrator owns all cross-call state: the attempt ledger keyed by the
//! source digest and the generation counter used to discard stale results.

use crate::config::PipelineConfig;
use crate::error::{BgRemovalError, Result};
use crate::loader::ImageLoader;
use crate::local::LocalInferenceStrategy;
use crate::remote::RemoteRemovalStrategy;
use crate::services::{ProcessingStage, ProgressReporter, ProgressTracker};
use crate::strategy::{RemovalRequest, RemovalStrategy};
use crate::types::{Credential, OutputImage, SourceDigest, SourceFile, SourceImage, StrategyKind};
use instant::Instant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Span};

/// Lifecycle of one removal call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    RemoteAttempt,
    LocalFallback,
    LocalAttempt,
    Succeeded(StrategyKind),
    Failed,
}

impl PipelineState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::RemoteAttempt | Self::Failed)
                | (
                    Self::RemoteAttempt,
                    Self::Succeeded(StrategyKind::Remote) | Self::LocalFallback
                )
                | (Self::LocalFallback, Self::LocalAttempt)
                | (
                    Self::LocalAttempt,
                    Self::Succeeded(StrategyKind::Local) | Self::Failed
                )
        )
    }

    /// Move to `next`
    ///
    /// # Errors
    /// - The transition is not part of the lifecycle
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            tracing::trace!(from = ?self, to = ?next, "pipeline state");
            Ok(next)
        } else {
            Err(BgRemovalError::internal(format!(
                "Invalid pipeline transition {self:?} -> {next:?}"
            )))
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed)
    }
}

#[derive(Debug, Default)]
struct LedgerEntry {
    in_flight: usize,
    latest_generation: u64,
}

/// Unresolved attempts per source image
#[derive(Debug, Default)]
struct AttemptLedger {
    entries: Mutex<HashMap<SourceDigest, LedgerEntry>>,
    generation: AtomicU64,
}

impl AttemptLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<SourceDigest, LedgerEntry>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, digest: SourceDigest, limit: usize) -> Result<AttemptGuard<'_>> {
        let mut entries = self.lock();
        let entry = entries.entry(digest).or_default();
        if entry.in_flight >= limit {
            return Err(BgRemovalError::AttemptsExhausted { limit });
        }
        entry.in_flight += 1;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        entry.latest_generation = generation;

        Ok(AttemptGuard {
            ledger: self,
            digest,
            generation,
            attempt: entry.in_flight,
        })
    }

    fn is_superseded(&self, digest: &SourceDigest, generation: u64) -> bool {
        self.lock()
            .get(digest)
            .is_some_and(|entry| entry.latest_generation > generation)
    }

    fn in_flight(&self, digest: &SourceDigest) -> usize {
        self.lock().get(digest).map_or(0, |entry| entry.in_flight)
    }

    fn release(&self, digest: &SourceDigest) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(digest) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 {
                entries.remove(digest);
            }
        }
    }
}

/// Releases an attempt registration on every exit path
struct AttemptGuard<'a> {
    ledger: &'a AttemptLedger,
    digest: SourceDigest,
    generation: u64,
    attempt: usize,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.ledger.release(&self.digest);
    }
}

/// Policy layer: remote first, then exactly one local attempt
pub struct RemovalOrchestrator {
    config: PipelineConfig,
    remote: Arc<dyn RemovalStrategy>,
    local: Arc<dyn RemovalStrategy>,
    ledger: AttemptLedger,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for RemovalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalOrchestrator")
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl RemovalOrchestrator {
    /// Orchestrator with the remove.bg strategy and the local segmentation model
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failure
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let remote = Arc::new(RemoteRemovalStrategy::new(&config)?);
        let local = Arc::new(LocalInferenceStrategy::new(&config));
        Ok(Self::with_strategies(config, remote, local))
    }

    /// Orchestrator with caller-provided strategies
    #[must_use]
    pub fn with_strategies(
        config: PipelineConfig,
        remote: Arc<dyn RemovalStrategy>,
        local: Arc<dyn RemovalStrategy>,
    ) -> Self {
        Self {
            config,
            remote,
            local,
            ledger: AttemptLedger::default(),
            reporter: None,
        }
    }

    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Unresolved attempts for this file's content
    #[must_use]
    pub fn attempts_in_flight(&self, file: &SourceFile) -> usize {
        self.ledger.in_flight(&file.digest())
    }

    /// Remove the background from `file`
    ///
    /// `credential` overrides the configured default when non-blank.
    ///
    /// # Errors
    /// - `Decode` when the file is not a supported image
    /// - `AttemptsExhausted` when too many calls for the same image are unresolved
    /// - `Superseded` when a newer call for the same image started meanwhile
    /// - `UnsupportedDevice`, `ResourceExhausted` or `ProcessingFailed` when both
    ///   strategies failed
    pub async fn remove(&self, file: &SourceFile, credential: Option<&str>) -> Result<OutputImage> {
        self.remove_cancellable(file, credential, CancellationToken::new())
            .await
    }

    /// Same as [`Self::remove`], returning `Cancelled` once `cancel` fires
    ///
    /// # Errors
    /// See [`Self::remove`]; additionally `Cancelled`.
    #[instrument(
        name = "remove_background",
        skip_all,
        fields(
            file = %file.file_name,
            bytes = file.len(),
            generation = tracing::field::Empty,
            attempt = tracing::field::Empty,
            strategy = tracing::field::Empty,
        )
    )]
    pub async fn remove_cancellable(
        &self,
        file: &SourceFile,
        credential: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<OutputImage> {
        let digest = file.digest();
        let guard = self
            .ledger
            .register(digest, self.config.max_attempts)
            .map_err(|e| {
                tracing::warn!(digest = ?digest, "{e}");
                e
            })?;

        let span = Span::current();
        span.record("generation", guard.generation);
        span.record("attempt", guard.attempt);

        let progress = self
            .reporter
            .clone()
            .map_or_else(ProgressTracker::no_op, ProgressTracker::new);
        let credential = credential.and_then(Credential::parse);

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BgRemovalError::Cancelled),
            result = self.run(file, credential.as_ref(), &guard, &progress) => result,
        };

        let outcome = match outcome {
            Err(BgRemovalError::Cancelled) => Err(BgRemovalError::Cancelled),
            _ if self.ledger.is_superseded(&digest, guard.generation) => {
                Err(BgRemovalError::Superseded {
                    generation: guard.generation,
                })
            },
            other => other,
        };

        match &outcome {
            Ok(output) => {
                span.record("strategy", tracing::field::display(output.strategy));
                progress.report_stage(ProcessingStage::Completed);
                progress.report_completion(output.metadata.timings.clone());
                tracing::info!(
                    total_ms = output.metadata.timings.total_ms,
                    "Background removed"
                );
            },
            Err(e) => {
                progress.report_error(ProcessingStage::Completed, &e.to_string());
                tracing::info!(error = %e, "Background removal did not complete");
            },
        }
        drop(guard);
        outcome
    }

    async fn run(
        &self,
        file: &SourceFile,
        credential: Option<&Credential>,
        guard: &AttemptGuard<'_>,
        progress: &ProgressTracker,
    ) -> Result<OutputImage> {
        let total_start = Instant::now();
        let mut state = PipelineState::Idle;

        progress.report_stage(ProcessingStage::Decoding);
        let decode_start = Instant::now();
        let image = match self.decode(file).await {
            Ok(image) => Arc::new(image),
            Err(e) => {
                state.transition(PipelineState::Failed)?;
                return Err(e);
            },
        };
        let image_decode_ms = decode_start.elapsed().as_millis() as u64;

        let request = RemovalRequest {
            file,
            image,
            credential,
            progress,
        };

        state = state.transition(PipelineState::RemoteAttempt)?;
        progress.report_stage(ProcessingStage::RemoteAttempt);
        let remote_start = Instant::now();
        let remote_result = self.remote.remove(&request).await;
        let remote_ms = remote_start.elapsed().as_millis() as u64;

        let mut output = match remote_result {
            Ok(output) => {
                state.transition(PipelineState::Succeeded(StrategyKind::Remote))?;
                output
            },
            Err(remote_error) => {
                tracing::warn!(
                    error = %remote_error,
                    "Remote removal failed, falling back to local inference"
                );
                state = state.transition(PipelineState::LocalFallback)?;
                progress.report_stage(ProcessingStage::LocalFallback);
                state = state.transition(PipelineState::LocalAttempt)?;

                match self.local.remove(&request).await {
                    Ok(output) => {
                        state.transition(PipelineState::Succeeded(StrategyKind::Local))?;
                        output
                    },
                    Err(local_error) => {
                        state.transition(PipelineState::Failed)?;
                        let classified = local_error.classify();
                        tracing::error!(error = %classified, "Local fallback failed");
                        return Err(classified);
                    },
                }
            },
        };

        let metadata = &mut output.metadata;
        metadata.attempt = guard.attempt;
        metadata.generation = guard.generation;
        metadata.timings.image_decode_ms = image_decode_ms;
        metadata.timings.remote_ms = Some(remote_ms);
        metadata.timings.total_ms = total_start.elapsed().as_millis() as u64;
        Ok(output)
    }

    async fn decode(&self, file: &SourceFile) -> Result<SourceImage> {
        let bytes = file.bytes.clone();
        let limit = self.config.max_decode_alloc_bytes;
        tokio::task::spawn_blocking(move || ImageLoader::load(&bytes, limit))
            .await
            .map_err(|e| BgRemovalError::internal(format!("Decode task failed: {e}")))?
    }
}
