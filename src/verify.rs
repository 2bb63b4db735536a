//! Perceptual pixel comparison for reproduce mode.
//!
//! Pixels are compared in YIQ space after blending alpha onto white, the same
//! metric pixelmatch uses; a pixel differs when its delta exceeds
//! `35215 * threshold^2` (35215 is the largest possible YIQ delta).

use crate::error::VerifyError;
use crate::image_decode::{decode_rgba, open_rgba};
use image::RgbaImage;
use serde::Serialize;
use std::path::Path;

pub const DEFAULT_PIXEL_THRESHOLD: f64 = 0.1;
const MAX_YIQ_DELTA: f64 = 35215.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    /// Fraction of differing pixels, 0..=1.
    pub percent_diff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Reproducible,
    NonReproducible,
}

pub fn classify(percent_diff: f64, tolerance: f64) -> Classification {
    if percent_diff < tolerance {
        Classification::Reproducible
    } else {
        Classification::NonReproducible
    }
}

/// Compares the original image on disk against freshly generated bytes.
pub fn compare_with_original(
    original: &Path,
    generated: &[u8],
    threshold: f64,
) -> Result<Comparison, VerifyError> {
    let left = open_rgba(original)?;
    let right = decode_rgba(generated)?;
    compare(&left, &right, threshold)
}

pub fn compare(left: &RgbaImage, right: &RgbaImage, threshold: f64) -> Result<Comparison, VerifyError> {
    if left.dimensions() != right.dimensions() {
        return Err(VerifyError::DimensionMismatch {
            left: left.dimensions(),
            right: right.dimensions(),
        });
    }

    let max_delta = MAX_YIQ_DELTA * threshold * threshold;
    let diff_pixels = left
        .pixels()
        .zip(right.pixels())
        .filter(|(a, b)| a != b && color_delta(a.0, b.0) > max_delta)
        .count() as u64;
    let total_pixels = u64::from(left.width()) * u64::from(left.height());
    let percent_diff = if total_pixels == 0 {
        0.0
    } else {
        diff_pixels as f64 / total_pixels as f64
    };

    Ok(Comparison {
        diff_pixels,
        total_pixels,
        percent_diff,
    })
}

fn color_delta(a: [u8; 4], b: [u8; 4]) -> f64 {
    let (r1, g1, b1) = blend_on_white(a);
    let (r2, g2, b2) = blend_on_white(b);

    let y = rgb_to_y(r1, g1, b1) - rgb_to_y(r2, g2, b2);
    let i = rgb_to_i(r1, g1, b1) - rgb_to_i(r2, g2, b2);
    let q = rgb_to_q(r1, g1, b1) - rgb_to_q(r2, g2, b2);

    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}

fn blend_on_white(pixel: [u8; 4]) -> (f64, f64, f64) {
    let alpha = f64::from(pixel[3]) / 255.0;
    let blend = |channel: u8| 255.0 + (f64::from(channel) - 255.0) * alpha;
    (blend(pixel[0]), blend(pixel[1]), blend(pixel[2]))
}

fn rgb_to_y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb_to_i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb_to_q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_identical_images_have_zero_difference() {
        let image = RgbaImage::from_fn(8, 8, |x, y| Rgba([x as u8 * 30, y as u8 * 30, 90, 255]));
        let result = compare(&image, &image.clone(), DEFAULT_PIXEL_THRESHOLD).unwrap();
        assert_eq!(result.diff_pixels, 0);
        assert_eq!(result.percent_diff, 0.0);
    }

    #[test]
    fn test_counts_perceptually_different_pixels() {
        let left = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        let mut right = left.clone();
        for x in 0..4 {
            for y in 0..2 {
                right.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        // barely visible change stays under the threshold
        right.put_pixel(0, 3, Rgba([254, 254, 254, 255]));

        let result = compare(&left, &right, DEFAULT_PIXEL_THRESHOLD).unwrap();
        assert_eq!(result.diff_pixels, 8);
        assert_eq!(result.total_pixels, 16);
        assert_eq!(result.percent_diff, 0.5);
    }

    #[test]
    fn test_transparent_pixels_blend_on_white() {
        let left = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0]));
        let right = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        assert_eq!(compare(&left, &right, 0.1).unwrap().diff_pixels, 0);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let left = RgbaImage::new(2, 2);
        let right = RgbaImage::new(2, 3);
        assert!(matches!(
            compare(&left, &right, 0.1),
            Err(VerifyError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_classification_against_tolerance() {
        assert_eq!(classify(0.10, 0.15), Classification::Reproducible);
        assert_eq!(classify(0.20, 0.15), Classification::NonReproducible);
        assert_eq!(classify(0.15, 0.15), Classification::NonReproducible);
    }
}
