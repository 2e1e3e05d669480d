//! U-Net decoder: nearest ×2 upsampling, skip concatenation and two
//! conv3x3-BN-ReLU stages per block.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use super::upsample_nearest;

/// Upsampling factor between consecutive decoder blocks.
pub const DECODER_SCALE: usize = 2;

/// Conv3x3 (no bias) followed by batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub conv1: ConvBnRelu<B>,
    pub conv2: ConvBnRelu<B>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv1: ConvBnRelu::new(in_channels + skip_channels, out_channels, device),
            conv2: ConvBnRelu::new(out_channels, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = upsample_nearest(x, DECODER_SCALE);
        let x = match skip {
            Some(skip) => Tensor::cat(vec![x, skip], 1),
            None => x,
        };
        let x = self.conv1.forward(x);
        self.conv2.forward(x)
    }
}

/// Five decoder blocks, deepest first. The last block has no skip input and
/// restores the full input resolution.
#[derive(Module, Debug)]
pub struct UnetDecoder<B: Backend> {
    pub blocks: Vec<DecoderBlock<B>>,
}

impl<B: Backend> UnetDecoder<B> {
    /// `encoder_channels` are shallowest first, `decoder_channels` deepest first.
    pub fn new(encoder_channels: [usize; 5], decoder_channels: &[usize], device: &B::Device) -> Self {
        // Skips for blocks 0..4: layer3, layer2, layer1, stem, none.
        let skip_channels = [
            encoder_channels[3],
            encoder_channels[2],
            encoder_channels[1],
            encoder_channels[0],
            0,
        ];

        let mut in_channels = encoder_channels[4];
        let blocks = decoder_channels
            .iter()
            .zip(skip_channels)
            .map(|(&out_channels, skip)| {
                let block = DecoderBlock::new(in_channels, skip, out_channels, device);
                in_channels = out_channels;
                block
            })
            .collect();

        Self { blocks }
    }

    /// Decodes `[stem, layer1, layer2, layer3, layer4]` encoder features.
    pub fn forward(&self, features: [Tensor<B, 4>; 5]) -> Tensor<B, 4> {
        let [stem, f1, f2, f3, f4] = features;
        let mut skips = [Some(f3), Some(f2), Some(f1), Some(stem), None].into_iter();

        self.blocks
            .iter()
            .fold(f4, |x, block| block.forward(x, skips.next().flatten()))
    }
}
