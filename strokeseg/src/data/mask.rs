//! Lesion mask extraction from annotated overlays.
//!
//! The CT dataset ships its annotations as copies of each slice with the
//! lesion painted red. A pixel is lesion when its hue lies in one of the two
//! red bands of the hue circle and it is saturated and bright enough.

use std::path::Path;

use image::{DynamicImage, GrayImage, Luma};

use crate::error::{StrokeSegError, StrokeSegResult};

/// Upper bound of the low red hue band (OpenCV 0..180 hue scale).
const RED_LOW_HUE_MAX: u8 = 10;
/// Lower bound of the high red hue band.
const RED_HIGH_HUE_MIN: u8 = 170;
const MIN_SATURATION: u8 = 50;
const MIN_VALUE: u8 = 50;

/// Converts an 8-bit RGB pixel to HSV using OpenCV's 8-bit conventions:
/// hue in `0..180`, saturation and value in `0..=255`.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (f32::from(r), f32::from(g), f32::from(b));
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = v - min;

    let s = if v > 0.0 { 255.0 * diff / v } else { 0.0 };

    let h = if diff == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / diff
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    (
        (h / 2.0).round().min(180.0) as u8,
        s.round() as u8,
        v as u8,
    )
}

/// Whether an HSV triple (OpenCV scale) is part of the red annotation.
pub fn is_lesion_hsv(h: u8, s: u8, v: u8) -> bool {
    let red_hue = h <= RED_LOW_HUE_MAX || h >= RED_HIGH_HUE_MIN;
    red_hue && s >= MIN_SATURATION && v >= MIN_VALUE
}

/// Extracts a binary mask (0 or 255) from a red-annotated overlay.
pub fn extract_lesion_mask(overlay: &DynamicImage) -> GrayImage {
    let rgb = overlay.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let (h, s, v) = rgb_to_hsv(r, g, b);
        if is_lesion_hsv(h, s, v) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Loads an overlay file and extracts its lesion mask.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::Image)` if the overlay cannot be decoded.
pub fn load_overlay_mask(path: &Path) -> StrokeSegResult<GrayImage> {
    let overlay = image::open(path).map_err(|source| StrokeSegError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(extract_lesion_mask(&overlay))
}

/// Empty mask for slices without an annotation.
pub fn empty_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::new(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn hsv_matches_opencv_primaries() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        assert_eq!(rgb_to_hsv(0, 255, 0), (60, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 0), (0, 0, 0));
        assert_eq!(rgb_to_hsv(128, 128, 128), (0, 0, 128));
    }

    #[test]
    fn both_red_bands_are_lesion() {
        assert!(is_lesion_hsv(0, 255, 255));
        assert!(is_lesion_hsv(175, 200, 200));
        assert!(!is_lesion_hsv(60, 255, 255));
        // Grey pixels are not saturated enough.
        assert!(!is_lesion_hsv(0, 0, 200));
        // Dark red is below the value threshold.
        assert!(!is_lesion_hsv(0, 255, 40));
    }

    #[test]
    fn overlay_extraction_finds_red_region() {
        let mut overlay = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        overlay.put_pixel(2, 3, Rgb([220, 20, 30]));
        overlay.put_pixel(5, 5, Rgb([200, 10, 120]));
        let mask = extract_lesion_mask(&DynamicImage::ImageRgb8(overlay));

        assert_eq!(mask.get_pixel(2, 3).0[0], 255);
        // Magenta-ish hue (~164) lies outside both bands.
        assert_eq!(mask.get_pixel(5, 5).0[0], 0);
        assert_eq!(mask.pixels().filter(|p| p.0[0] == 255).count(), 1);
    }
}
