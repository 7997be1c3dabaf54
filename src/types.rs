//! Core types for background removal operations

use crate::error::{BgRemovalError, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use sha2::{Digest, Sha256};
use std::path::Path;

/// The caller's original upload
///
/// The remote strategy sends these bytes verbatim; the local strategy decodes them.
#[derive(Clone)]
pub struct SourceFile {
    /// Raw file contents
    pub bytes: Vec<u8>,
    /// File name attached to the multipart upload
    pub file_name: String,
    /// MIME type, if known
    pub mime: Option<String>,
}

impl SourceFile {
    /// Wrap raw bytes, guessing the MIME type from their content
    #[must_use]
    pub fn new<S: Into<String>>(bytes: Vec<u8>, file_name: S) -> Self {
        let mime = image::guess_format(&bytes)
            .ok()
            .map(|format| format.to_mime_type().to_string());
        Self {
            bytes,
            file_name: file_name.into(),
            mime,
        }
    }

    /// Override the MIME type
    #[must_use]
    pub fn with_mime<S: Into<String>>(mut self, mime: S) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Read a file from disk
    ///
    /// # Errors
    /// - File not found or unreadable
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| BgRemovalError::file_io_error("read input image", path, &e))?;
        let file_name = path
            .file_name()
            .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(bytes, file_name))
    }

    /// SHA-256 digest identifying this upload in the attempt ledger
    #[must_use]
    pub fn digest(&self) -> SourceDigest {
        SourceDigest(Sha256::digest(&self.bytes).into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// SHA-256 digest of a source file's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceDigest([u8; 32]);

impl std::fmt::Display for SourceDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SourceDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to correlate log lines
        let hex = self.to_string();
        write!(f, "SourceDigest({})", hex.get(..12).unwrap_or(&hex))
    }
}

/// Decoded source bitmap with its natural dimensions
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: DynamicImage,
    /// Detected container format
    pub format: Option<ImageFormat>,
}

impl SourceImage {
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
}

/// RGBA pixel buffer whose longer side does not exceed the configured bound
#[derive(Debug, Clone)]
pub struct BoundedCanvas {
    pub pixels: RgbaImage,
}

impl BoundedCanvas {
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Number of pixels, which is also the required mask length
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.pixels.width() as usize * self.pixels.height() as usize
    }
}

/// Per-pixel class probability map, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    /// Mask values in `[0, 1]`
    pub data: Vec<f32>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<f32>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fraction of pixels with a value above 0.5
    #[must_use]
    pub fn coverage(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let covered = self.data.iter().filter(|v| **v > 0.5).count();
        covered as f32 / self.data.len() as f32
    }
}

/// One labelled entry of a segmentation result
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Class label as reported by the model configuration
    pub label: String,
    /// Mean probability over the pixels this class wins, when the model provides one
    pub score: Option<f32>,
    pub mask: SegmentationMask,
}

/// Which strategy produced an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Remote,
    Local,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Timing breakdown for one pipeline invocation, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingTimings {
    /// Source decode
    pub image_decode_ms: u64,

    /// Remote request, if attempted
    pub remote_ms: Option<u64>,

    /// Backend initialization (first call only)
    pub model_load_ms: Option<u64>,

    /// Resize and intermediate JPEG encode
    pub preprocessing_ms: u64,

    /// Segmentation inference
    pub inference_ms: u64,

    /// Mask compositing and PNG encode
    pub postprocessing_ms: u64,

    /// Total end-to-end processing time
    pub total_ms: u64,
}

impl ProcessingTimings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Time spent in the local strategy
    #[must_use]
    pub fn local_ms(&self) -> u64 {
        self.model_load_ms.unwrap_or(0)
            + self.preprocessing_ms
            + self.inference_ms
            + self.postprocessing_ms
    }
}

/// Metadata attached to every output
#[derive(Debug, Clone, Default)]
pub struct ProcessingMetadata {
    pub timings: ProcessingTimings,
    /// Whether the local path downscaled the source
    pub was_resized: bool,
    /// Ordinal of this attempt among unresolved attempts for the same image
    pub attempt: usize,
    /// Generation tag of the invocation
    pub generation: u64,
    /// Model used by the local path
    pub model_name: Option<String>,
}

/// Encoded result image
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub bytes: Vec<u8>,
    /// Detected format, best effort for remote output
    pub format: Option<ImageFormat>,
    /// Detected dimensions, best effort for remote output
    pub dimensions: Option<(u32, u32)>,
    pub strategy: StrategyKind,
    pub metadata: ProcessingMetadata,
}

impl OutputImage {
    /// Build an output, probing format and dimensions from the encoded bytes
    #[must_use]
    pub fn from_encoded(bytes: Vec<u8>, strategy: StrategyKind) -> Self {
        let format = image::guess_format(&bytes).ok();
        let dimensions = image::ImageReader::new(std::io::Cursor::new(&bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        Self {
            bytes,
            format,
            dimensions,
            strategy,
            metadata: ProcessingMetadata::default(),
        }
    }

    /// Preferred file extension for the detected format
    #[must_use]
    pub fn extension(&self) -> &'static str {
        self.format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("png")
    }

    /// Write the encoded bytes to disk
    ///
    /// # Errors
    /// - File system errors when writing
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, &self.bytes)
            .map_err(|e| BgRemovalError::file_io_error("write output image", path, &e))
    }

    /// Decode the output back into pixels
    ///
    /// # Errors
    /// - Output bytes are not decodable
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.bytes).map_err(BgRemovalError::Decode)
    }
}

/// API key for the remote service
///
/// `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Accept a credential only if it is non-blank
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}
