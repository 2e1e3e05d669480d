use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use serde::{Deserialize, Serialize};

use super::backend::BackendKind;
use crate::error::{StrokeSegError, StrokeSegResult};

/// Probability map, thresholded mask and confidence of one image.
///
/// Maps are row-major at the backend's input resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub probability_map: Vec<f32>,
    pub binary_mask: Vec<bool>,
    pub height: usize,
    pub width: usize,
    /// Mean probability over the positive pixels, `0.0` when there are none.
    pub confidence: f32,
    pub backend: BackendKind,
    pub threshold: f32,
}

impl PredictionResult {
    /// Thresholds `probabilities` (`p >= threshold` is positive) and computes
    /// the confidence. Every backend goes through this function.
    pub fn from_probabilities(
        probabilities: Vec<f32>,
        height: usize,
        width: usize,
        threshold: f32,
        backend: BackendKind,
    ) -> Self {
        debug_assert_eq!(probabilities.len(), height * width);
        let binary_mask: Vec<bool> = probabilities.iter().map(|&p| p >= threshold).collect();

        let (sum, count) = probabilities
            .iter()
            .zip(&binary_mask)
            .filter(|(_, positive)| **positive)
            .fold((0.0f64, 0usize), |(sum, n), (&p, _)| (sum + f64::from(p), n + 1));
        let confidence = if count == 0 {
            0.0
        } else {
            (sum / count as f64) as f32
        };

        Self {
            probability_map: probabilities,
            binary_mask,
            height,
            width,
            confidence,
            backend,
            threshold,
        }
    }

    pub fn positive_pixels(&self) -> usize {
        self.binary_mask.iter().filter(|&&m| m).count()
    }

    /// Fraction of pixels at which two masks of the same size differ.
    pub fn mask_disagreement(&self, other: &Self) -> f32 {
        if self.binary_mask.is_empty() {
            return 0.0;
        }
        let differing = self
            .binary_mask
            .iter()
            .zip(&other.binary_mask)
            .filter(|(a, b)| a != b)
            .count();
        differing as f32 / self.binary_mask.len() as f32
    }

    /// The mask as a black/white image.
    pub fn mask_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let i = y as usize * self.width + x as usize;
            Luma([if self.binary_mask[i] { 255 } else { 0 }])
        })
    }

    /// The probability map scaled to `0..=255`.
    pub fn probability_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let p = self.probability_map[y as usize * self.width + x as usize];
            Luma([(p.clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }

    /// PNG bytes of [`PredictionResult::mask_image`].
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ImageEncode)` if encoding fails.
    pub fn mask_png(&self) -> StrokeSegResult<Vec<u8>> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(self.mask_image())
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|source| StrokeSegError::ImageEncode { source })?;
        Ok(bytes)
    }
}
