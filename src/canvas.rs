//! Bounding and resizing of decoded images for local inference

use crate::types::{BoundedCanvas, SourceImage};
use image::imageops::{self, FilterType};

/// Scales images so their longer side fits a maximum dimension
pub struct Resizer;

impl Resizer {
    /// Target dimensions for bounding `(width, height)` to `max_dimension`
    ///
    /// Returns `None` when the image already fits. When width exceeds height,
    /// width is the long side; otherwise (including squares) height is.
    #[must_use]
    pub fn bounded_dimensions(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
        if width <= max_dimension && height <= max_dimension {
            return None;
        }

        let scale_short = |short: u32, long: u32| -> u32 {
            // round(short * max / long) in integer arithmetic
            let numerator = u64::from(short) * u64::from(max_dimension);
            let long = u64::from(long);
            let rounded = (2 * numerator + long) / (2 * long);
            u32::try_from(rounded).unwrap_or(u32::MAX).max(1)
        };

        if width > height {
            Some((max_dimension, scale_short(height, width)))
        } else {
            Some((scale_short(width, height), max_dimension))
        }
    }

    /// Produce a canvas whose longer side is at most `max_dimension`
    ///
    /// Returns the canvas and whether a resize happened. Images already within
    /// bounds are copied unchanged.
    #[must_use]
    pub fn bound(image: &SourceImage, max_dimension: u32) -> (BoundedCanvas, bool) {
        let (width, height) = image.dimensions();
        let rgba = image.pixels.to_rgba8();

        match Self::bounded_dimensions(width, height, max_dimension) {
            None => (BoundedCanvas { pixels: rgba }, false),
            Some((new_width, new_height)) => {
                log::debug!("Resizing {width}x{height} -> {new_width}x{new_height}");
                let pixels = imageops::resize(&rgba, new_width, new_height, FilterType::Triangle);
                (BoundedCanvas { pixels }, true)
            },
        }
    }
}
