use std::path::Path;

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use resnet::{ResNetEncoder, ResNetEncoderConfig};

use super::decoder::UnetDecoder;
use crate::{
    config::ModelConfig,
    error::{StrokeSegError, StrokeSegResult},
};

/// U-Net with a ResNet encoder producing single-channel lesion logits.
#[derive(Module, Debug)]
pub struct StrokeUNet<B: Backend> {
    pub encoder: ResNetEncoder<B>,
    pub decoder: UnetDecoder<B>,
    pub head: Conv2d<B>,
}

impl ModelConfig {
    /// Builds a freshly initialised model, loading pretrained encoder weights
    /// when `pretrained_weights` is set.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for an invalid
    /// configuration and `Err(StrokeSegError::Record)` if the encoder
    /// weights cannot be loaded.
    pub fn init<B: Backend>(&self, device: &B::Device) -> StrokeSegResult<StrokeUNet<B>> {
        self.validate()?;

        let encoder = ResNetEncoderConfig::new()
            .with_depth(self.encoder)
            .with_base_width(self.encoder_width)
            .init(device);
        let encoder = match &self.pretrained_weights {
            Some(path) => super::pretrained::load_torchvision_encoder(encoder, path, device)?,
            None => encoder,
        };

        let decoder = UnetDecoder::new(self.encoder_channels(), &self.decoder_channels, device);

        let last_channels = self.decoder_channels[self.decoder_channels.len() - 1];
        let mut head = Conv2dConfig::new([last_channels, 1], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: 0.01,
            })
            .init(device);
        head.bias = Some(Param::from_tensor(Tensor::full(
            [1],
            self.head_bias(),
            device,
        )));

        Ok(StrokeUNet {
            encoder,
            decoder,
            head,
        })
    }

    /// Builds the model and loads weights saved with [`StrokeUNet::save`].
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::Record)` if the record cannot be loaded.
    pub fn load<B: Backend>(
        &self,
        weights: &Path,
        device: &B::Device,
    ) -> StrokeSegResult<StrokeUNet<B>> {
        // Pretrained encoder weights are superseded by the record.
        let model = self
            .clone()
            .with_pretrained_weights(None)
            .init::<B>(device)?;

        model
            .load_file(weights.to_path_buf(), &weights_recorder(), device)
            .map_err(|e| StrokeSegError::Record {
                action: "load",
                path: weights.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// Recorder used for checkpoint weights. Appends the `.mpk` extension.
pub fn weights_recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

impl<B: Backend> StrokeUNet<B> {
    /// Maps `[N, 3, H, W]` normalised images to `[N, H, W]` logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let features = self.encoder.forward(images);
        let x = self.decoder.forward(features);
        self.head.forward(x).squeeze::<3>(1)
    }

    /// Saves the weights to `path` (the recorder adds `.mpk`).
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::Record)` if the file cannot be written.
    pub fn save(self, path: &Path) -> StrokeSegResult<()> {
        self.save_file(path.to_path_buf(), &weights_recorder())
            .map_err(|e| StrokeSegError::Record {
                action: "save",
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}
