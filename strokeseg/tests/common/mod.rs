#![allow(dead_code)]

use std::{path::Path, sync::Mutex};

use burn::backend::{Autodiff, NdArray};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use strokeseg::{
    config::ResNetDepth,
    data::{Sample, SampleSource},
    ModelConfig, TrainingConfig,
};

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

/// NdArray seeds one global generator, so training runs must not interleave.
pub static TRAINING_LOCK: Mutex<()> = Mutex::new(());

pub fn tiny_model() -> ModelConfig {
    ModelConfig::new()
        .with_encoder(ResNetDepth::Resnet18)
        .with_encoder_width(8)
        .with_decoder_channels(vec![32, 16, 8, 8, 4])
        .with_image_height(64)
        .with_image_width(64)
}

pub fn tiny_training(output_dir: &Path) -> TrainingConfig {
    TrainingConfig::new(tiny_model())
        .with_num_epochs(1)
        .with_batch_size(2)
        .with_learning_rate(1e-3)
        .with_seed(7)
        .with_output_dir(output_dir.to_path_buf())
}

/// Dark slice with a bright square lesion whose position depends on `index`.
pub fn synthetic_sample(index: usize) -> Sample {
    let offset = 8 + 4 * (index as u32 % 4);
    let image = RgbImage::from_fn(64, 64, |x, y| {
        let inside = (offset..offset + 16).contains(&x) && (offset..offset + 16).contains(&y);
        if inside {
            Rgb([220, 220, 220])
        } else {
            Rgb([30, 30, 30])
        }
    });
    let mask = GrayImage::from_fn(64, 64, |x, y| {
        let inside = (offset..offset + 16).contains(&x) && (offset..offset + 16).contains(&y);
        Luma([if inside { 255 } else { 0 }])
    });

    Sample {
        id: format!("synthetic_{index}"),
        source: SampleSource::Memory {
            image: DynamicImage::ImageRgb8(image),
            mask,
        },
    }
}

pub fn synthetic_samples(count: usize) -> Vec<Sample> {
    (0..count).map(synthetic_sample).collect()
}
