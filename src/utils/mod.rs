//! Tensor conversion helpers shared by the inference backends

pub mod postprocessing;
pub mod preprocessing;

pub use postprocessing::segments_from_logits;
pub use preprocessing::ImagePreprocessor;
