//! Conversion of model logits into labelled segments

use crate::{
    error::{BgRemovalError, Result},
    models::ModelInfo,
    types::{Segment, SegmentationMask},
};
use image::{imageops::FilterType, ImageBuffer, Luma};
use ndarray::{Array4, Axis};

/// Turn `[1, C, h, w]` model output into segments sized `width x height`
///
/// Multi-class outputs are treated as logits: a softmax runs per pixel, and one
/// segment is emitted for every class that wins the argmax somewhere, ordered by
/// class index. Single-channel outputs yield one segment with clamped values.
///
/// # Errors
/// - Output tensor is not `[1, C, h, w]` with non-zero dimensions
pub fn segments_from_logits(
    output: &Array4<f32>,
    info: &ModelInfo,
    width: u32,
    height: u32,
) -> Result<Vec<Segment>> {
    let (batch, classes, mask_height, mask_width) = output.dim();
    if batch != 1 || classes == 0 || mask_height == 0 || mask_width == 0 {
        return Err(BgRemovalError::inference(format!(
            "Unexpected output tensor shape {:?}",
            output.shape()
        )));
    }

    let planes = output.index_axis(Axis(0), 0);

    if classes == 1 {
        let plane = planes.index_axis(Axis(0), 0);
        let values: Vec<f32> = plane.iter().map(|v| v.clamp(0.0, 1.0)).collect();
        let mask = upsample(values, mask_width, mask_height, width, height)?;
        return Ok(vec![Segment {
            label: info.label(0),
            score: None,
            mask,
        }]);
    }

    let pixels = mask_width * mask_height;
    let mut probabilities = vec![0.0f32; classes * pixels];
    let mut winners = vec![0usize; pixels];

    for (pixel, winner) in winners.iter_mut().enumerate() {
        let (y, x) = (pixel / mask_width, pixel % mask_width);
        let logits: Vec<f32> = (0..classes)
            .map(|c| planes.get([c, y, x]).copied().unwrap_or(f32::NEG_INFINITY))
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();

        let mut best = (0, f32::NEG_INFINITY);
        for (class, e) in exps.iter().enumerate() {
            let p = e / sum;
            if let Some(slot) = probabilities.get_mut(class * pixels + pixel) {
                *slot = p;
            }
            if p > best.1 {
                best = (class, p);
            }
        }
        *winner = best.0;
    }

    let mut segments = Vec::new();
    for class in 0..classes {
        let won: Vec<usize> = winners
            .iter()
            .enumerate()
            .filter_map(|(pixel, w)| (*w == class).then_some(pixel))
            .collect();
        if won.is_empty() {
            continue;
        }

        let plane = probabilities
            .get(class * pixels..(class + 1) * pixels)
            .unwrap_or(&[])
            .to_vec();
        let score = won
            .iter()
            .map(|p| plane.get(*p).copied().unwrap_or(0.0))
            .sum::<f32>()
            / won.len() as f32;

        segments.push(Segment {
            label: info.label(class),
            score: Some(score),
            mask: upsample(plane, mask_width, mask_height, width, height)?,
        });
    }

    Ok(segments)
}

/// Bilinear resize of a row-major plane
fn upsample(
    values: Vec<f32>,
    src_width: usize,
    src_height: usize,
    width: u32,
    height: u32,
) -> Result<SegmentationMask> {
    let (src_w, src_h) = (src_width as u32, src_height as u32);
    if (src_w, src_h) == (width, height) {
        return Ok(SegmentationMask::new(values, (width, height)));
    }

    let plane: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(src_w, src_h, values)
        .ok_or_else(|| BgRemovalError::inference("Mask plane has wrong length"))?;
    let resized = image::imageops::resize(&plane, width, height, FilterType::Triangle);
    Ok(SegmentationMask::new(
        resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect(),
        (width, height),
    ))
}
