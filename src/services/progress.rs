//! Progress reporting service
//!
//! Keeps progress reporting out of the pipeline logic so each frontend can
//! render stages its own way.

use crate::types::ProcessingTimings;
use instant::Instant;
use std::sync::Arc;

/// Stages of a background removal call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Decoding the source image
    Decoding,
    /// Sending the source to the remote service
    RemoteAttempt,
    /// Remote failed, switching to local inference
    LocalFallback,
    /// Loading the segmentation model
    ModelLoading,
    /// Bounding the image to the maximum dimension
    Resizing,
    /// Running segmentation
    Inference,
    /// Writing the mask into the alpha channel
    Compositing,
    /// Encoding the output image
    Encoding,
    /// Processing completed
    Completed,
}

impl ProcessingStage {
    /// Human-readable description of the stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Decoding => "Decoding input image",
            ProcessingStage::RemoteAttempt => "Removing background remotely",
            ProcessingStage::LocalFallback => "Falling back to local processing",
            ProcessingStage::ModelLoading => "Loading segmentation model",
            ProcessingStage::Resizing => "Resizing image",
            ProcessingStage::Inference => "Running segmentation",
            ProcessingStage::Compositing => "Applying mask",
            ProcessingStage::Encoding => "Encoding result",
            ProcessingStage::Completed => "Processing completed",
        }
    }

    /// Typical progress percentage when the stage starts
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            ProcessingStage::Decoding => 5,
            ProcessingStage::RemoteAttempt => 10,
            ProcessingStage::LocalFallback => 40,
            ProcessingStage::ModelLoading => 45,
            ProcessingStage::Resizing => 55,
            ProcessingStage::Inference => 65,
            ProcessingStage::Compositing => 90,
            ProcessingStage::Encoding => 95,
            ProcessingStage::Completed => 100,
        }
    }
}

/// Progress update containing stage and timing information
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stage: ProcessingStage,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub description: String,
    /// Milliseconds since the call started
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(stage: ProcessingStage, start_time: Instant) -> Self {
        Self {
            progress: stage.progress_percentage(),
            description: stage.description().to_string(),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            stage,
        }
    }
}

/// Trait for reporting progress during background removal
pub trait ProgressReporter: Send + Sync {
    /// Report a progress update
    fn report_progress(&self, update: ProgressUpdate);

    /// Report completion with final timings
    fn report_completion(&self, timings: ProcessingTimings);

    /// Report an error during processing
    fn report_error(&self, stage: ProcessingStage, error: &str);
}

/// Progress reporter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _timings: ProcessingTimings) {}

    fn report_error(&self, _stage: ProcessingStage, _error: &str) {}
}

/// Progress reporter that logs stages
#[derive(Debug, Clone, Copy)]
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}%] {} ({}ms elapsed)",
                update.progress,
                update.description,
                update.elapsed_ms
            );
        } else {
            log::info!("[{}%] {}", update.progress, update.description);
        }
    }

    fn report_completion(&self, timings: ProcessingTimings) {
        log::info!("Background removal completed in {}ms", timings.total_ms);

        if self.verbose {
            log::info!("  Image decode: {}ms", timings.image_decode_ms);
            if let Some(remote_ms) = timings.remote_ms {
                log::info!("  Remote attempt: {remote_ms}ms");
            }
            if let Some(model_load_ms) = timings.model_load_ms {
                log::info!("  Model load: {model_load_ms}ms");
            }
            log::info!("  Preprocessing: {}ms", timings.preprocessing_ms);
            log::info!("  Inference: {}ms", timings.inference_ms);
            log::info!("  Postprocessing: {}ms", timings.postprocessing_ms);
        }
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        log::error!("Error during {}: {}", stage.description(), error);
    }
}

/// Per-call progress tracker
///
/// Cheap to clone, so the blocking part of the local strategy can report
/// stages too.
#[derive(Clone)]
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("elapsed_ms", &self.elapsed_ms())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    #[must_use]
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn no_op() -> Self {
        Self::new(Arc::new(NoOpProgressReporter))
    }

    #[must_use]
    pub fn console(verbose: bool) -> Self {
        Self::new(Arc::new(ConsoleProgressReporter::new(verbose)))
    }

    pub fn report_stage(&self, stage: ProcessingStage) {
        self.reporter
            .report_progress(ProgressUpdate::new(stage, self.start_time));
    }

    pub fn report_completion(&self, timings: ProcessingTimings) {
        self.reporter.report_completion(timings);
    }

    pub fn report_error(&self, stage: ProcessingStage, error: &str) {
        self.reporter.report_error(stage, error);
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::no_op()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        stages: Mutex<Vec<ProcessingStage>>,
        completions: Mutex<Vec<ProcessingTimings>>,
        errors: Mutex<Vec<(ProcessingStage, String)>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report_progress(&self, update: ProgressUpdate) {
            self.stages.lock().unwrap().push(update.stage);
        }

        fn report_completion(&self, timings: ProcessingTimings) {
            self.completions.lock().unwrap().push(timings);
        }

        fn report_error(&self, stage: ProcessingStage, error: &str) {
            self.errors.lock().unwrap().push((stage, error.to_string()));
        }
    }

    #[test]
    fn test_stage_percentages_are_monotonic() {
        let stages = [
            ProcessingStage::Decoding,
            ProcessingStage::RemoteAttempt,
            ProcessingStage::LocalFallback,
            ProcessingStage::ModelLoading,
            ProcessingStage::Resizing,
            ProcessingStage::Inference,
            ProcessingStage::Compositing,
            ProcessingStage::Encoding,
            ProcessingStage::Completed,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].progress_percentage() < pair[1].progress_percentage());
        }
        assert_eq!(ProcessingStage::Completed.progress_percentage(), 100);
    }

    #[test]
    fn test_clones_report_to_the_same_reporter() {
        let reporter = Arc::new(RecordingReporter::default());
        let tracker = ProgressTracker::new(reporter.clone());
        let clone = tracker.clone();

        tracker.report_stage(ProcessingStage::Decoding);
        clone.report_stage(ProcessingStage::Inference);
        clone.report_error(ProcessingStage::Inference, "boom");
        tracker.report_completion(ProcessingTimings {
            total_ms: 42,
            ..ProcessingTimings::default()
        });

        assert_eq!(
            *reporter.stages.lock().unwrap(),
            vec![ProcessingStage::Decoding, ProcessingStage::Inference]
        );
        assert_eq!(reporter.errors.lock().unwrap()[0].1, "boom");
        assert_eq!(reporter.completions.lock().unwrap()[0].total_ms, 42);
    }

    #[test]
    fn test_update_carries_description() {
        let update = ProgressUpdate::new(ProcessingStage::Compositing, Instant::now());
        assert_eq!(update.description, "Applying mask");
        assert_eq!(update.progress, 90);
    }
}
