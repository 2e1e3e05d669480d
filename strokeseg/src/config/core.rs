//! Core configuration structures for strokeseg.
//!
//! [`ModelConfig`] fixes the architecture and input resolution of the U-Net,
//! [`PreprocessConfig`] fixes how images are brought to that resolution. Both
//! travel with every checkpoint, graph and engine so that all three backends
//! see identical inputs.

use std::path::PathBuf;

use burn::prelude::*;

use super::enums::*;
use crate::error::{StrokeSegError, StrokeSegResult};

/// Spatial stride of the deepest encoder level.
pub const OUTPUT_STRIDE: usize = 32;

/// Number of decoder stages; one per encoder feature level.
pub const DECODER_STAGES: usize = 5;

/// Architecture and input resolution of the segmentation model.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Encoder depth.
    #[config(default = "ResNetDepth::Resnet34")]
    pub encoder: ResNetDepth,
    /// Stem width of the encoder. Pretrained weights require 64.
    #[config(default = 64)]
    pub encoder_width: usize,
    /// Output channels of the five decoder blocks, deepest first.
    #[config(default = "vec![256, 128, 64, 32, 16]")]
    pub decoder_channels: Vec<usize>,
    /// Input height. Must be a positive multiple of 32.
    #[config(default = 256)]
    pub image_height: usize,
    /// Input width. Must be a positive multiple of 32.
    #[config(default = 256)]
    pub image_width: usize,
    /// Prior foreground probability used to initialise the head bias.
    #[config(default = 0.01)]
    pub head_prior_probability: f64,
    /// Torchvision ResNet `.pth` file used to initialise the encoder.
    #[config(default = "None")]
    pub pretrained_weights: Option<PathBuf>,
}

/// Per-channel normalisation applied after scaling pixels to `[0, 1]`.
#[derive(Config, Debug)]
pub struct NormalizationConfig {
    #[config(default = "[0.485, 0.456, 0.406]")]
    pub mean: [f32; 3],
    #[config(default = "[0.229, 0.224, 0.225]")]
    pub std: [f32; 3],
}

/// Deterministic preprocessing shared by training and serving.
#[derive(Config, Debug)]
pub struct PreprocessConfig {
    #[config(default = "ResizeMode::Stretch")]
    pub resize_mode: ResizeMode,
    #[config(default = "NormalizationConfig::new()")]
    pub normalization: NormalizationConfig,
}

impl ModelConfig {
    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> StrokeSegResult<()> {
        for (name, value) in [
            ("image_height", self.image_height),
            ("image_width", self.image_width),
        ] {
            if value == 0 || value % OUTPUT_STRIDE != 0 {
                return Err(StrokeSegError::InvalidConfiguration {
                    reason: format!(
                        "{name} must be a positive multiple of {OUTPUT_STRIDE}, got {value}"
                    ),
                });
            }
        }

        if self.decoder_channels.len() != DECODER_STAGES {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "decoder_channels must have {DECODER_STAGES} entries, got {}",
                    self.decoder_channels.len()
                ),
            });
        }

        if self.decoder_channels.contains(&0) || self.encoder_width == 0 {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: "channel counts must be non-zero".to_string(),
            });
        }

        if !(self.head_prior_probability > 0.0 && self.head_prior_probability < 1.0) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "head_prior_probability must lie in (0, 1), got {}",
                    self.head_prior_probability
                ),
            });
        }

        if self.pretrained_weights.is_some() && self.encoder_width != resnet::TORCHVISION_BASE_WIDTH
        {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "pretrained encoder weights require encoder_width {}, got {}",
                    resnet::TORCHVISION_BASE_WIDTH,
                    self.encoder_width
                ),
            });
        }

        Ok(())
    }

    /// Channels of the encoder feature levels, shallowest first.
    pub fn encoder_channels(&self) -> [usize; 5] {
        resnet::ResNetEncoderConfig::new()
            .with_depth(self.encoder)
            .with_base_width(self.encoder_width)
            .out_channels()
    }

    /// Input resolution as `[height, width]`.
    pub const fn input_size(&self) -> [usize; 2] {
        [self.image_height, self.image_width]
    }

    /// Bias of the segmentation head, `-ln((1 - p) / p)`.
    pub fn head_bias(&self) -> f64 {
        let p = self.head_prior_probability;
        -((1.0 - p) / p).ln()
    }
}

impl NormalizationConfig {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` if a standard deviation is not positive.
    pub fn validate(&self) -> StrokeSegResult<()> {
        if self.std.iter().any(|s| !(*s > 0.0)) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!("normalization std must be positive, got {:?}", self.std),
            });
        }
        Ok(())
    }
}
