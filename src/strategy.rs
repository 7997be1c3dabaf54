//! Removal strategy abstraction

use crate::error::Result;
use crate::services::ProgressTracker;
use crate::types::{Credential, OutputImage, SourceFile, SourceImage, StrategyKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a strategy may need for one removal
#[derive(Debug, Clone)]
pub struct RemovalRequest<'a> {
    /// Original upload, sent verbatim by the remote strategy
    pub file: &'a SourceFile,
    /// Decoded source, used by the local strategy
    pub image: Arc<SourceImage>,
    /// Caller-supplied credential override
    pub credential: Option<&'a Credential>,
    pub progress: &'a ProgressTracker,
}

/// One way of removing a background
///
/// Strategies never retry internally; the orchestrator decides what happens
/// after a failure.
#[async_trait]
pub trait RemovalStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Produce an image with the background removed
    ///
    /// # Errors
    /// Strategy-specific failures; see the implementations.
    async fn remove(&self, request: &RemovalRequest<'_>) -> Result<OutputImage>;
}
