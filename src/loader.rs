//! Image decoding for uploaded blobs

use crate::error::{BgRemovalError, Result};
use crate::types::SourceImage;
use image::{ImageReader, Limits};
use std::io::Cursor;

/// Decodes binary image blobs into bitmaps
pub struct ImageLoader;

impl ImageLoader {
    /// Decode `bytes`, guessing the format from content
    ///
    /// Decoding allocations are capped at `max_alloc_bytes`; exceeding the cap is
    /// reported as a decode error whose cause is resource exhaustion.
    ///
    /// # Errors
    /// - Bytes are not a supported raster format
    /// - Image exceeds the allocation limit
    pub fn load(bytes: &[u8], max_alloc_bytes: u64) -> Result<SourceImage> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| BgRemovalError::Decode(image::ImageError::IoError(e)))?;

        // Unknown formats fail in decode() with an Unsupported error
        let format = reader.format();

        let mut limits = Limits::default();
        limits.max_alloc = Some(max_alloc_bytes);
        reader.limits(limits);

        let pixels = reader.decode().map_err(BgRemovalError::Decode)?;
        log::debug!(
            "Decoded {:?} image: {}x{}",
            format,
            pixels.width(),
            pixels.height()
        );

        Ok(SourceImage { pixels, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCause;
    use image::{ImageEncoder, RgbImage};

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([200, 100, 50]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn test_load_jpeg() {
        let image = ImageLoader::load(&jpeg_bytes(40, 20), 64 * 1024 * 1024).unwrap();
        assert_eq!(image.dimensions(), (40, 20));
        assert_eq!(image.format, Some(image::ImageFormat::Jpeg));
    }

    #[test]
    fn test_corrupt_blob_is_decode_error() {
        let err = ImageLoader::load(b"\x00\x01garbage", 1024).unwrap_err();
        assert!(matches!(err, BgRemovalError::Decode(_)));
        assert_eq!(err.cause(), FailureCause::Other);
    }

    #[test]
    fn test_truncated_jpeg_is_decode_error() {
        let bytes = jpeg_bytes(64, 64);
        let truncated = &bytes[..bytes.len() / 3];
        let err = ImageLoader::load(truncated, 64 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, BgRemovalError::Decode(_)));
    }

    #[test]
    fn test_allocation_limit_is_resource_exhaustion() {
        let err = ImageLoader::load(&jpeg_bytes(256, 256), 1024).unwrap_err();
        assert!(matches!(err, BgRemovalError::Decode(_)));
        assert_eq!(err.cause(), FailureCause::ResourceExhausted);
    }
}
