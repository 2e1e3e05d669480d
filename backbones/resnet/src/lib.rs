//! ResNet encoder for U-Net style segmentation.
//!
//! Based on torchvision's ResNet, restricted to the basic-block variants
//! (ResNet-18 and ResNet-34). The encoder exposes five feature levels at
//! strides 2, 4, 8, 16 and 32, which is what a U-Net decoder consumes as skip
//! connections.

use core::f64::consts::SQRT_2;

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
};
use burn::prelude::*;

mod blocks;
pub use blocks::*;

const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];

/// Width of the torchvision stem; pretrained weights only fit this width.
pub const TORCHVISION_BASE_WIDTH: usize = 64;

/// Stem max pooling: 3x3, stride 2, padding 1.
pub const STEM_POOL_KERNEL: [usize; 2] = [3, 3];
pub const STEM_POOL_STRIDE: [usize; 2] = [2, 2];
pub const STEM_POOL_PADDING: [usize; 2] = [1, 1];

/// Supported encoder depths.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ResNetDepth {
    /// ResNet-18, blocks [2, 2, 2, 2].
    Resnet18,
    /// ResNet-34, blocks [3, 4, 6, 3].
    Resnet34,
}

impl ResNetDepth {
    /// Number of basic blocks per stage.
    pub const fn blocks(&self) -> [usize; 4] {
        match self {
            Self::Resnet18 => RESNET18_BLOCKS,
            Self::Resnet34 => RESNET34_BLOCKS,
        }
    }
}

/// Configuration for [`ResNetEncoder`].
#[derive(Config, Debug)]
pub struct ResNetEncoderConfig {
    #[config(default = "ResNetDepth::Resnet34")]
    pub depth: ResNetDepth,
    /// Channel count of the stem and the first stage. Later stages double it.
    #[config(default = 64)]
    pub base_width: usize,
}

impl ResNetEncoderConfig {
    /// Channels of the five feature levels returned by [`ResNetEncoder::forward`].
    pub const fn out_channels(&self) -> [usize; 5] {
        let w = self.base_width;
        [w, w, w * 2, w * 4, w * 8]
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNetEncoder<B> {
        ResNetEncoder::new(self.depth.blocks(), self.base_width, device)
    }
}

/// ResNet encoder.
///
/// `conv1`/`bn1`/`layer*` keep torchvision names; see [`blocks`] for the
/// per-block layout.
#[derive(Module, Debug)]
pub struct ResNetEncoder<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub relu: Relu,
    pub maxpool: MaxPool2d,
    pub layer1: LayerBlock<B>,
    pub layer2: LayerBlock<B>,
    pub layer3: LayerBlock<B>,
    pub layer4: LayerBlock<B>,
}

impl<B: Backend> ResNetEncoder<B> {
    /// Returns `[stem, layer1, layer2, layer3, layer4]`.
    ///
    /// The stem feature is taken after conv1/bn1/relu and before max pooling.
    pub fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 5] {
        let stem = self.conv1.forward(input);
        let stem = self.bn1.forward(stem);
        let stem = self.relu.forward(stem);

        let x = self.maxpool.forward(stem.clone());
        let f1 = self.layer1.forward(x);
        let f2 = self.layer2.forward(f1.clone());
        let f3 = self.layer3.forward(f2.clone());
        let f4 = self.layer4.forward(f3.clone());

        [stem, f1, f2, f3, f4]
    }

    /// Create ResNet-18 encoder with torchvision widths.
    pub fn resnet18(device: &Device<B>) -> Self {
        Self::new(RESNET18_BLOCKS, TORCHVISION_BASE_WIDTH, device)
    }

    /// Create ResNet-34 encoder with torchvision widths.
    pub fn resnet34(device: &Device<B>) -> Self {
        Self::new(RESNET34_BLOCKS, TORCHVISION_BASE_WIDTH, device)
    }

    fn new(blocks: [usize; 4], width: usize, device: &Device<B>) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        // 7x7 conv, stride=2, padding=3
        let conv1 = Conv2dConfig::new([3, width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .with_initializer(initializer)
            .init(device);
        let bn1 = BatchNormConfig::new(width).init(device);

        let [pad_h, pad_w] = STEM_POOL_PADDING;
        let maxpool = MaxPool2dConfig::new(STEM_POOL_KERNEL)
            .with_strides(STEM_POOL_STRIDE)
            .with_padding(PaddingConfig2d::Explicit(pad_h, pad_w))
            .init();

        let layer1 = LayerBlock::new(blocks[0], width, width, 1, device);
        let layer2 = LayerBlock::new(blocks[1], width, width * 2, 2, device);
        let layer3 = LayerBlock::new(blocks[2], width * 2, width * 4, 2, device);
        let layer4 = LayerBlock::new(blocks[3], width * 4, width * 8, 2, device);

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_encoder_config_channels() {
        let config = ResNetEncoderConfig::new().with_base_width(16);
        assert_eq!(config.out_channels(), [16, 16, 32, 64, 128]);
        assert_eq!(config.depth.blocks(), [3, 4, 6, 3]);
    }

    #[test]
    fn test_resnet18_forward() {
        let device = Default::default();
        let model = ResNetEncoder::<TestBackend>::resnet18(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let output = model.forward(input);

        assert_eq!(output[0].dims(), [1, 64, 32, 32]);
        assert_eq!(output[1].dims(), [1, 64, 16, 16]);
        assert_eq!(output[2].dims(), [1, 128, 8, 8]);
        assert_eq!(output[3].dims(), [1, 256, 4, 4]);
        assert_eq!(output[4].dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn test_narrow_resnet34_forward() {
        let device = Default::default();
        let model = ResNetEncoderConfig::new()
            .with_base_width(8)
            .init::<TestBackend>(&device);

        assert_eq!(model.layer3.blocks.len(), 6);
        assert!(model.layer2.blocks[0].downsample.is_some());
        assert!(model.layer2.blocks[1].downsample.is_none());

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output[4].dims(), [2, 64, 1, 1]);
    }
}
