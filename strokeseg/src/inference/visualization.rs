//! Side-by-side rendering of a prediction.

use std::path::Path;

use image::{imageops, DynamicImage, RgbImage};

use super::result::PredictionResult;
use crate::error::{StrokeSegError, StrokeSegResult};

/// Original, probability map and binary mask, left to right.
///
/// `original` must already be at the prediction's resolution, e.g. from
/// [`super::InferenceEngine::resized_input`].
pub fn render_panels(original: &RgbImage, result: &PredictionResult) -> RgbImage {
    let (w, h) = (result.width as u32, result.height as u32);
    let mut canvas = RgbImage::new(w * 3, h);

    let original = if original.dimensions() == (w, h) {
        original.clone()
    } else {
        imageops::resize(original, w, h, imageops::FilterType::Triangle)
    };
    let probability = DynamicImage::ImageLuma8(result.probability_image()).to_rgb8();
    let mask = DynamicImage::ImageLuma8(result.mask_image()).to_rgb8();

    imageops::replace(&mut canvas, &original, 0, 0);
    imageops::replace(&mut canvas, &probability, i64::from(w), 0);
    imageops::replace(&mut canvas, &mask, 2 * i64::from(w), 0);
    canvas
}

/// Renders and writes the panels as a PNG.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::Image)` if the file cannot be written.
pub fn save_panels(path: &Path, original: &RgbImage, result: &PredictionResult) -> StrokeSegResult<()> {
    render_panels(original, result)
        .save(path)
        .map_err(|source| StrokeSegError::Image {
            path: path.to_path_buf(),
            source,
        })
}
