//! Shared fixtures for unit tests.

use burn::backend::{Autodiff, NdArray};

use crate::config::{ModelConfig, ResNetDepth};

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

/// A narrow ResNet-18 U-Net at 64x64 that runs quickly on the CPU.
pub fn tiny_config() -> ModelConfig {
    ModelConfig::new()
        .with_encoder(ResNetDepth::Resnet18)
        .with_encoder_width(8)
        .with_decoder_channels(vec![32, 16, 8, 8, 4])
        .with_image_height(64)
        .with_image_width(64)
}
