//! Image to tensor conversion for segmentation models

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Resize to the model input size and convert to a normalized NCHW tensor
    ///
    /// The image is stretched to `target_size`; callers map the output back to
    /// the original dimensions, so no padding is involved.
    ///
    /// # Errors
    /// - Zero-sized input image
    pub fn preprocess_image(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(BgRemovalError::inference("Cannot preprocess an empty image"));
        }

        let [target_height, target_width] = preprocessing_config.target_size;
        let rgb = image.to_rgb8();
        let resized = if rgb.dimensions() == (target_width, target_height) {
            rgb
        } else {
            image::imageops::resize(&rgb, target_width, target_height, FilterType::Triangle)
        };

        Ok(Self::image_to_tensor(&resized, preprocessing_config))
    }

    fn image_to_tensor(image: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        let scale = config.rescale_factor.unwrap_or(1.0);

        for (x, y, pixel) in image.enumerate_pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                let mut v = f32::from(*value) * scale;
                if config.do_normalize {
                    let mean = config.normalization_mean.get(channel).copied().unwrap_or(0.0);
                    let std = config.normalization_std.get(channel).copied().unwrap_or(1.0);
                    v = (v - mean) / std;
                }
                if let Some(slot) = tensor.get_mut([0, channel, y as usize, x as usize]) {
                    *slot = v;
                }
            }
        }

        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn config(size: u32, normalize: bool) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [size, size],
            normalization_mean: [0.5, 0.5, 0.5],
            normalization_std: [0.5, 0.5, 0.5],
            rescale_factor: Some(1.0 / 255.0),
            do_normalize: normalize,
        }
    }

    #[test]
    fn test_tensor_shape_follows_target_size() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(40, 10));
        let mut cfg = config(16, true);
        cfg.target_size = [8, 16];
        let tensor = ImagePreprocessor::preprocess_image(&image, &cfg).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 8, 16]);
    }

    #[test]
    fn test_normalization_values() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 255])));
        let tensor = ImagePreprocessor::preprocess_image(&image, &config(4, true)).unwrap();
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-5);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-5);

        let tensor = ImagePreprocessor::preprocess_image(&image, &config(4, false)).unwrap();
        assert!((tensor[[0, 0, 2, 2]] - 1.0).abs() < 1e-5);
        assert!(tensor[[0, 1, 2, 2]].abs() < 1e-5);
    }

    #[test]
    fn test_empty_image_rejected() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(ImagePreprocessor::preprocess_image(&image, &config(4, true)).is_err());
    }
}
