//! Mask compositing and output encoding
//!
//! The segmentation mask is transferred into the alpha channel of the bounded
//! canvas. RGB always comes from the canvas, never from the lossy intermediate.

use crate::config::MaskPolarity;
use crate::error::{BgRemovalError, FailureCause, Result};
use crate::types::{BoundedCanvas, SegmentationMask};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};

/// Alpha value for one mask sample
#[must_use]
pub fn mask_to_alpha(value: f32, polarity: MaskPolarity) -> u8 {
    let value = value.clamp(0.0, 1.0);
    let opacity = match polarity {
        MaskPolarity::Background => 1.0 - value,
        MaskPolarity::Foreground => value,
    };
    (opacity * 255.0).round() as u8
}

/// Write `mask` into the alpha channel of a copy of `canvas`
///
/// # Errors
/// - Mask dimensions do not match the canvas
/// - Output buffer allocation fails (cause: resource exhausted)
pub fn composite(
    canvas: &BoundedCanvas,
    mask: &SegmentationMask,
    polarity: MaskPolarity,
) -> Result<RgbaImage> {
    let (width, height) = (canvas.width(), canvas.height());
    if mask.dimensions != (width, height) || mask.len() != canvas.pixel_count() {
        return Err(BgRemovalError::composite(
            FailureCause::Other,
            format!(
                "Mask {}x{} ({} values) does not match canvas {width}x{height}",
                mask.dimensions.0,
                mask.dimensions.1,
                mask.len()
            ),
        ));
    }

    let source = canvas.pixels.as_raw();
    let mut buffer: Vec<u8> = Vec::new();
    buffer.try_reserve_exact(source.len()).map_err(|e| {
        BgRemovalError::composite(
            FailureCause::ResourceExhausted,
            format!("Failed to allocate {} byte output buffer: {e}", source.len()),
        )
    })?;

    for (pixel, value) in source.chunks_exact(4).zip(&mask.data) {
        buffer.extend_from_slice(pixel.get(..3).unwrap_or(&[0, 0, 0]));
        buffer.push(mask_to_alpha(*value, polarity));
    }

    RgbaImage::from_raw(width, height, buffer).ok_or_else(|| {
        BgRemovalError::composite(FailureCause::Other, "Composited buffer has wrong length")
    })
}

/// Encode RGB content of the canvas as a lossy JPEG intermediate
///
/// # Errors
/// - JPEG encoding failure
pub fn encode_jpeg(canvas: &BoundedCanvas, quality: u8) -> Result<Vec<u8>> {
    let rgb = image::DynamicImage::ImageRgba8(canvas.pixels.clone()).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| {
            BgRemovalError::composite(
                FailureCause::Other,
                format!("Failed to encode intermediate JPEG: {e}"),
            )
        })?;
    Ok(out)
}

/// Encode an RGBA image as PNG
///
/// # Errors
/// - PNG encoding failure
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|e| {
            BgRemovalError::composite(FailureCause::Other, format!("Failed to encode PNG: {e}"))
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(width: u32, height: u32) -> BoundedCanvas {
        BoundedCanvas {
            pixels: RgbaImage::from_pixel(width, height, image::Rgba([12, 34, 56, 255])),
        }
    }

    #[test]
    fn test_background_polarity_alpha() {
        assert_eq!(mask_to_alpha(1.0, MaskPolarity::Background), 0);
        assert_eq!(mask_to_alpha(0.0, MaskPolarity::Background), 255);
        assert_eq!(mask_to_alpha(0.5, MaskPolarity::Background), 128);
    }

    #[test]
    fn test_foreground_polarity_alpha() {
        assert_eq!(mask_to_alpha(1.0, MaskPolarity::Foreground), 255);
        assert_eq!(mask_to_alpha(0.0, MaskPolarity::Foreground), 0);
    }

    #[test]
    fn test_composite_keeps_canvas_rgb() {
        let canvas = canvas(2, 2);
        let mask = SegmentationMask::new(vec![1.0, 0.0, 0.25, 0.75], (2, 2));
        let out = composite(&canvas, &mask, MaskPolarity::Background).unwrap();

        let alphas: Vec<u8> = out.pixels().map(|p| p.0[3]).collect();
        assert_eq!(alphas, vec![0, 255, 191, 64]);
        for pixel in out.pixels() {
            assert_eq!(&pixel.0[..3], &[12, 34, 56]);
        }
    }

    #[test]
    fn test_composite_rejects_mismatched_mask() {
        let err = composite(
            &canvas(3, 2),
            &SegmentationMask::new(vec![0.0; 5], (3, 2)),
            MaskPolarity::Background,
        )
        .unwrap_err();
        assert!(matches!(err, BgRemovalError::Composite { .. }));
    }

    #[test]
    fn test_png_output_has_alpha() {
        let out = composite(
            &canvas(4, 4),
            &SegmentationMask::new(vec![1.0; 16], (4, 4)),
            MaskPolarity::Background,
        )
        .unwrap();
        let png = encode_png(&out).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert!(decoded.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_jpeg_intermediate_decodes_to_canvas_size() {
        let jpeg = encode_jpeg(&canvas(33, 17), 80).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (33, 17));
    }

    #[test]
    fn test_jpeg_intermediate_rejects_oversized_canvas() {
        // Baseline JPEG caps each side at 65535
        let err = encode_jpeg(&canvas(70_000, 1), 80).unwrap_err();
        assert!(matches!(err, BgRemovalError::Composite { .. }), "got {err:?}");
    }
}
