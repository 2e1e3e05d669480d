//! Data augmentation and tensorization.
//!
//! Training applies, in order:
//! 1. Horizontal flip (50% probability)
//! 2. Brightness/contrast jitter (30% probability, limits ±0.05)
//! 3. Shift/scale/rotate (30% probability, shift ±5%, scale ±5%, rotation ±5°)
//!
//! Evaluation only resizes and normalises, and is bit-for-bit deterministic.
//! Every stage draws from a single `StdRng`, so a given seed always yields the
//! same augmented sample.

use burn::{
    prelude::*,
    tensor::{Tensor, TensorData},
};
use image::{
    imageops::{self, FilterType},
    DynamicImage, GrayImage, Luma, Rgb, RgbImage,
};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::{ModelConfig, NormalizationConfig, PreprocessConfig, ResizeMode},
    error::{StrokeSegError, StrokeSegResult},
};

/// Mask pixels above this value count as lesion after resizing.
const MASK_BINARY_THRESHOLD: u8 = 127;

/// Whether random augmentation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Train,
    Eval,
}

/// Probabilities and magnitudes of the training augmentations.
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    #[config(default = 0.5)]
    pub flip_probability: f64,
    #[config(default = 0.3)]
    pub brightness_contrast_probability: f64,
    /// Additive brightness shift, as a fraction of the full pixel range.
    #[config(default = 0.05)]
    pub brightness_limit: f32,
    /// Multiplicative contrast change around 1.0.
    #[config(default = 0.05)]
    pub contrast_limit: f32,
    #[config(default = 0.3)]
    pub shift_scale_rotate_probability: f64,
    /// Translation as a fraction of the image side.
    #[config(default = 0.05)]
    pub shift_limit: f32,
    #[config(default = 0.05)]
    pub scale_limit: f32,
    /// Rotation limit in degrees.
    #[config(default = 5.0)]
    pub rotate_limit: f32,
}

impl AugmentationConfig {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for probabilities outside `[0, 1]`
    /// or negative limits.
    pub fn validate(&self) -> StrokeSegResult<()> {
        for (name, p) in [
            ("flip_probability", self.flip_probability),
            (
                "brightness_contrast_probability",
                self.brightness_contrast_probability,
            ),
            (
                "shift_scale_rotate_probability",
                self.shift_scale_rotate_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(StrokeSegError::InvalidConfiguration {
                    reason: format!("{name} must lie in [0, 1], got {p}"),
                });
            }
        }

        let limits = [
            self.brightness_limit,
            self.contrast_limit,
            self.shift_limit,
            self.scale_limit,
            self.rotate_limit,
        ];
        if limits.iter().any(|l| !(*l >= 0.0)) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!("augmentation limits must be non-negative, got {limits:?}"),
            });
        }

        Ok(())
    }
}

/// A sample after augmentation, ready to be stacked into a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedSample {
    /// Normalised image in `[3, H, W]` layout.
    pub image: Vec<f32>,
    /// Binary mask in `[H, W]` layout, values in `{0.0, 1.0}`.
    pub mask: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl TransformedSample {
    pub fn image_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(
            TensorData::new(self.image.clone(), [3, self.height, self.width]),
            device,
        )
    }

    pub fn mask_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(self.mask.clone(), [self.height, self.width]),
            device,
        )
    }
}

/// Resizes, augments and normalises image/mask pairs.
#[derive(Debug, Clone)]
pub struct Augmentor {
    height: u32,
    width: u32,
    preprocess: PreprocessConfig,
    augmentation: AugmentationConfig,
}

impl Augmentor {
    pub fn new(
        model: &ModelConfig,
        preprocess: PreprocessConfig,
        augmentation: AugmentationConfig,
    ) -> Self {
        Self {
            height: model.image_height as u32,
            width: model.image_width as u32,
            preprocess,
            augmentation,
        }
    }

    /// Evaluation-only augmentor.
    pub fn for_eval(model: &ModelConfig, preprocess: PreprocessConfig) -> Self {
        Self::new(model, preprocess, AugmentationConfig::new())
    }

    /// Evaluation-only augmentor producing `[H, W] = size` inputs.
    pub fn for_eval_at(size: [usize; 2], preprocess: PreprocessConfig) -> Self {
        Self {
            height: size[0] as u32,
            width: size[1] as u32,
            preprocess,
            augmentation: AugmentationConfig::new(),
        }
    }

    pub const fn output_size(&self) -> [usize; 2] {
        [self.height as usize, self.width as usize]
    }

    pub const fn preprocess(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Transforms one image/mask pair.
    ///
    /// In [`TransformMode::Train`] the random stages are driven by `seed`, or by
    /// a fresh random seed when none is given. [`TransformMode::Eval`] ignores
    /// the seed.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::DataShapeMismatch)` if image and mask sizes differ.
    pub fn transform(
        &self,
        id: &str,
        image: &DynamicImage,
        mask: &GrayImage,
        mode: TransformMode,
        seed: Option<u64>,
    ) -> StrokeSegResult<TransformedSample> {
        let image_dims = (image.width(), image.height());
        if image_dims != mask.dimensions() {
            return Err(StrokeSegError::DataShapeMismatch {
                id: id.to_string(),
                image: image_dims,
                mask: mask.dimensions(),
            });
        }

        let mut rgb = self.resize_image(&image.to_rgb8());
        let mut mask = self.resize_mask(mask);

        if mode == TransformMode::Train {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or_else(rand::random));
            (rgb, mask) = self.augment(rgb, mask, &mut rng);
        }

        Ok(TransformedSample {
            image: normalize_chw(&rgb, &self.preprocess.normalization),
            mask: mask
                .pixels()
                .map(|p| if p.0[0] > MASK_BINARY_THRESHOLD { 1.0 } else { 0.0 })
                .collect(),
            height: self.height as usize,
            width: self.width as usize,
        })
    }

    /// Eval-mode preprocessing of a bare image, returning `[3, H, W]` data.
    pub fn preprocess_image(&self, image: &DynamicImage) -> Vec<f32> {
        normalize_chw(&self.resized_rgb(image), &self.preprocess.normalization)
    }

    /// The image as the model sees it, before normalisation.
    pub fn resized_rgb(&self, image: &DynamicImage) -> RgbImage {
        self.resize_image(&image.to_rgb8())
    }

    fn augment(
        &self,
        mut image: RgbImage,
        mut mask: GrayImage,
        rng: &mut StdRng,
    ) -> (RgbImage, GrayImage) {
        let config = &self.augmentation;

        if rng.random_bool(config.flip_probability) {
            imageops::flip_horizontal_in_place(&mut image);
            imageops::flip_horizontal_in_place(&mut mask);
        }

        if rng.random_bool(config.brightness_contrast_probability) {
            let alpha = 1.0 + rng.random_range(-config.contrast_limit..=config.contrast_limit);
            let beta =
                rng.random_range(-config.brightness_limit..=config.brightness_limit) * 255.0;
            adjust_brightness_contrast(&mut image, alpha, beta);
        }

        if rng.random_bool(config.shift_scale_rotate_probability) {
            let projection = self.random_affine(rng);
            image = warp(&image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]));
            mask = warp(&mask, &projection, Interpolation::Nearest, Luma([0]));
        }

        (image, mask)
    }

    fn random_affine(&self, rng: &mut StdRng) -> Projection {
        let config = &self.augmentation;
        let (w, h) = (self.width as f32, self.height as f32);

        let dx = rng.random_range(-config.shift_limit..=config.shift_limit) * w;
        let dy = rng.random_range(-config.shift_limit..=config.shift_limit) * h;
        let scale = 1.0 + rng.random_range(-config.scale_limit..=config.scale_limit);
        let angle = rng
            .random_range(-config.rotate_limit..=config.rotate_limit)
            .to_radians();

        let (cx, cy) = (w / 2.0, h / 2.0);
        Projection::translate(cx + dx, cy + dy)
            * Projection::rotate(angle)
            * Projection::scale(scale, scale)
            * Projection::translate(-cx, -cy)
    }

    fn resize_image(&self, image: &RgbImage) -> RgbImage {
        self.resize_with(image, FilterType::Triangle)
    }

    fn resize_mask(&self, mask: &GrayImage) -> GrayImage {
        self.resize_with(mask, FilterType::Nearest)
    }

    fn resize_with<P>(
        &self,
        image: &image::ImageBuffer<P, Vec<u8>>,
        filter: FilterType,
    ) -> image::ImageBuffer<P, Vec<u8>>
    where
        P: image::Pixel<Subpixel = u8> + 'static,
    {
        if image.dimensions() == (self.width, self.height) {
            return image.clone();
        }

        match self.preprocess.resize_mode {
            ResizeMode::Stretch => imageops::resize(image, self.width, self.height, filter),
            ResizeMode::Letterbox => {
                let (src_w, src_h) = image.dimensions();
                let scale = f64::min(
                    f64::from(self.width) / f64::from(src_w),
                    f64::from(self.height) / f64::from(src_h),
                );
                let fit_w = ((f64::from(src_w) * scale).round() as u32).clamp(1, self.width);
                let fit_h = ((f64::from(src_h) * scale).round() as u32).clamp(1, self.height);
                let resized = imageops::resize(image, fit_w, fit_h, filter);

                let mut canvas = image::ImageBuffer::new(self.width, self.height);
                let x = i64::from((self.width - fit_w) / 2);
                let y = i64::from((self.height - fit_h) / 2);
                imageops::replace(&mut canvas, &resized, x, y);
                canvas
            }
        }
    }
}

fn adjust_brightness_contrast(image: &mut RgbImage, alpha: f32, beta: f32) {
    let lut: Vec<u8> = (0..=255u8)
        .map(|v| f32::from(v).mul_add(alpha, beta).round().clamp(0.0, 255.0) as u8)
        .collect();
    for subpixel in image.iter_mut() {
        *subpixel = lut[usize::from(*subpixel)];
    }
}

/// Scales to `[0, 1]`, normalises per channel and converts HWC to CHW.
fn normalize_chw(image: &RgbImage, normalization: &NormalizationConfig) -> Vec<f32> {
    let plane = (image.width() * image.height()) as usize;
    let mut out = vec![0.0f32; plane * 3];

    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            let v = f32::from(pixel.0[c]) / 255.0;
            out[c * plane + i] = (v - normalization.mean[c]) / normalization.std[c];
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn model_config() -> ModelConfig {
        ModelConfig::new().with_image_height(64).with_image_width(64)
    }

    fn gradient_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3) as u8, (y * 2) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn square_mask(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            if (20..40).contains(&x) && (10..30).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn eval_transform_is_deterministic() {
        let augmentor = Augmentor::for_eval(&model_config(), PreprocessConfig::new());
        let image = gradient_image(80, 70);
        let mask = square_mask(80, 70);

        let a = augmentor
            .transform("a", &image, &mask, TransformMode::Eval, Some(1))
            .unwrap();
        let b = augmentor
            .transform("a", &image, &mask, TransformMode::Eval, Some(2))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.image.len(), 3 * 64 * 64);
        assert_eq!(a.mask.len(), 64 * 64);
    }

    #[test]
    fn train_transform_repeats_for_same_seed() {
        let augmentor = Augmentor::new(
            &model_config(),
            PreprocessConfig::new(),
            AugmentationConfig::new()
                .with_flip_probability(1.0)
                .with_brightness_contrast_probability(1.0)
                .with_shift_scale_rotate_probability(1.0),
        );
        let image = gradient_image(64, 64);
        let mask = square_mask(64, 64);

        let a = augmentor
            .transform("a", &image, &mask, TransformMode::Train, Some(7))
            .unwrap();
        let b = augmentor
            .transform("a", &image, &mask, TransformMode::Train, Some(7))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mask_stays_binary_after_augmentation() {
        let augmentor = Augmentor::new(
            &model_config(),
            PreprocessConfig::new(),
            AugmentationConfig::new().with_shift_scale_rotate_probability(1.0),
        );
        let sample = augmentor
            .transform(
                "a",
                &gradient_image(90, 50),
                &square_mask(90, 50),
                TransformMode::Train,
                Some(3),
            )
            .unwrap();

        assert!(sample.mask.iter().all(|v| *v == 0.0 || *v == 1.0));
        assert!(sample.mask.iter().any(|v| *v == 1.0));
    }

    #[test]
    fn forced_flip_mirrors_mask() {
        let augmentor = Augmentor::new(
            &model_config(),
            PreprocessConfig::new(),
            AugmentationConfig::new()
                .with_flip_probability(1.0)
                .with_brightness_contrast_probability(0.0)
                .with_shift_scale_rotate_probability(0.0),
        );
        let mut mask = GrayImage::new(64, 64);
        mask.put_pixel(0, 5, Luma([255]));

        let sample = augmentor
            .transform(
                "a",
                &gradient_image(64, 64),
                &mask,
                TransformMode::Train,
                None,
            )
            .unwrap();

        assert_eq!(sample.mask[5 * 64 + 63], 1.0);
        assert_eq!(sample.mask[5 * 64], 0.0);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let augmentor = Augmentor::for_eval(&model_config(), PreprocessConfig::new());
        let result = augmentor.transform(
            "ct_001",
            &gradient_image(64, 64),
            &square_mask(32, 64),
            TransformMode::Eval,
            None,
        );

        match result {
            Err(StrokeSegError::DataShapeMismatch { id, image, mask }) => {
                assert_eq!(id, "ct_001");
                assert_eq!(image, (64, 64));
                assert_eq!(mask, (32, 64));
            }
            other => panic!("Expected DataShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn letterbox_pads_with_zeros() {
        let preprocess = PreprocessConfig::new().with_resize_mode(ResizeMode::Letterbox);
        let augmentor = Augmentor::for_eval(&model_config(), preprocess);
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(128, 64, Rgb([255, 255, 255])));
        let mask = GrayImage::from_pixel(128, 64, Luma([255]));

        let sample = augmentor
            .transform("wide", &white, &mask, TransformMode::Eval, None)
            .unwrap();

        // 128x64 fits as 64x32, centred vertically: rows 0..16 are padding.
        assert_eq!(sample.mask[0], 0.0);
        assert_eq!(sample.mask[32 * 64], 1.0);
        let mean = NormalizationConfig::new().mean[0];
        let std = NormalizationConfig::new().std[0];
        assert!((sample.image[0] - (0.0 - mean) / std).abs() < 1e-6);
    }

    #[test]
    fn tensors_have_channel_first_layout() {
        let augmentor = Augmentor::for_eval(&model_config(), PreprocessConfig::new());
        let sample = augmentor
            .transform(
                "a",
                &gradient_image(64, 64),
                &square_mask(64, 64),
                TransformMode::Eval,
                None,
            )
            .unwrap();
        let device = Default::default();

        assert_eq!(sample.image_tensor::<NdArray>(&device).dims(), [3, 64, 64]);
        assert_eq!(sample.mask_tensor::<NdArray>(&device).dims(), [64, 64]);
    }
}
