//! Error types for background removal operations
//!
//! Strategies report failures with an explicit [`FailureCause`] so the orchestrator
//! can classify terminal errors without inspecting message text.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for background removal operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Root cause attached to local-strategy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// A requested accelerator or execution provider is not usable on this machine
    UnsupportedDevice,
    /// An allocation failed or a memory limit was hit
    ResourceExhausted,
    /// Anything else
    Other,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedDevice => write!(f, "unsupported device"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Comprehensive error types for background removal operations
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input bytes are not a decodable raster image
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// Remote service answered with a non-success status
    #[error("Remote service rejected the request with HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    /// Remote service could not be reached
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Remote request exceeded the configured timeout
    #[error("Remote request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Neither the caller nor the configuration supplied an API credential
    #[error("No API credential available for the remote service")]
    MissingCredential,

    /// Model files or the inference runtime could not be initialized
    #[error("Model error: {message}")]
    ModelLoad { message: String, cause: FailureCause },

    /// Segmentation output was malformed or inference failed
    #[error("Inference error: {message}")]
    Inference { message: String, cause: FailureCause },

    /// Pixel buffer manipulation or output encoding failed
    #[error("Compositing error: {message}")]
    Composite { message: String, cause: FailureCause },

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Too many unresolved attempts for the same source image
    #[error("Attempt ceiling reached: {limit} removal(s) already in flight for this image")]
    AttemptsExhausted { limit: usize },

    /// A newer request for the same image started before this one finished
    #[error("Result discarded: superseded by a newer request (generation {generation})")]
    Superseded { generation: u64 },

    /// The caller cancelled the request
    #[error("Background removal was cancelled")]
    Cancelled,

    /// Terminal failure caused by missing device or accelerator support
    #[error("Unsupported device: {source}")]
    UnsupportedDevice {
        #[source]
        source: Box<BgRemovalError>,
    },

    /// Terminal failure caused by memory exhaustion
    #[error("Resource exhausted: {source}")]
    ResourceExhausted {
        #[source]
        source: Box<BgRemovalError>,
    },

    /// Any other terminal failure after every strategy was tried
    #[error("Background removal failed: {source}")]
    ProcessingFailed {
        #[source]
        source: Box<BgRemovalError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgRemovalError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model loading error
    pub fn model_load<S: Into<String>>(cause: FailureCause, msg: S) -> Self {
        Self::ModelLoad {
            message: msg.into(),
            cause,
        }
    }

    /// Create a new inference error with no specific cause
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference {
            message: msg.into(),
            cause: FailureCause::Other,
        }
    }

    /// Create a new compositing error
    pub fn composite<S: Into<String>>(cause: FailureCause, msg: S) -> Self {
        Self::Composite {
            message: msg.into(),
            cause,
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a network error wrapping the transport failure
    pub fn network<S, E>(msg: S, error: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Network {
            message: msg.into(),
            source: Box::new(error),
        }
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Failure cause carried by this error
    #[must_use]
    pub fn cause(&self) -> FailureCause {
        match self {
            Self::ModelLoad { cause, .. }
            | Self::Inference { cause, .. }
            | Self::Composite { cause, .. } => *cause,
            Self::Decode(image::ImageError::Limits(limit))
                if matches!(
                    limit.kind(),
                    image::error::LimitErrorKind::InsufficientMemory
                ) =>
            {
                FailureCause::ResourceExhausted
            },
            Self::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                FailureCause::ResourceExhausted
            },
            Self::UnsupportedDevice { .. } => FailureCause::UnsupportedDevice,
            Self::ResourceExhausted { .. } => FailureCause::ResourceExhausted,
            Self::ProcessingFailed { source } => source.cause(),
            _ => FailureCause::Other,
        }
    }

    /// Whether this error belongs to the remote strategy
    #[must_use]
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::Remote { .. } | Self::Network { .. } | Self::Timeout(_) | Self::MissingCredential
        )
    }

    /// Map a terminal error to the caller-facing class
    ///
    /// Orchestration outcomes (attempt ceiling, superseded, cancelled), decode
    /// failures, configuration errors and already-classified errors pass through.
    #[must_use]
    pub fn classify(self) -> Self {
        match self {
            Self::Decode(_)
            | Self::InvalidConfig(_)
            | Self::AttemptsExhausted { .. }
            | Self::Superseded { .. }
            | Self::Cancelled
            | Self::UnsupportedDevice { .. }
            | Self::ResourceExhausted { .. }
            | Self::ProcessingFailed { .. } => self,
            other => match other.cause() {
                FailureCause::UnsupportedDevice => Self::UnsupportedDevice {
                    source: Box::new(other),
                },
                FailureCause::ResourceExhausted => Self::ResourceExhausted {
                    source: Box::new(other),
                },
                FailureCause::Other => Self::ProcessingFailed {
                    source: Box::new(other),
                },
            },
        }
    }

    /// Single human-readable sentence suitable for showing to an end user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Decode(_) => "The selected file is not a supported image.".to_string(),
            Self::InvalidConfig(msg) => format!("Background removal is misconfigured: {msg}."),
            Self::AttemptsExhausted { .. } => {
                "Background removal is already running for this image. Please wait for it to finish."
                    .to_string()
            },
            Self::Superseded { .. } => {
                "A newer request for this image replaced this one.".to_string()
            },
            Self::Cancelled => "Background removal was cancelled.".to_string(),
            Self::UnsupportedDevice { .. } => {
                "Your device does not support the processing this image needs. Please try another device."
                    .to_string()
            },
            Self::ResourceExhausted { .. } => {
                "Not enough memory to process this image. Please try a smaller image.".to_string()
            },
            _ => "Failed to remove background. Please try again.".to_string(),
        }
    }
}
