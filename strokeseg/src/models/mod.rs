//! Segmentation model.

pub mod decoder;
pub mod pretrained;
pub mod unet;

use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

pub use decoder::{ConvBnRelu, DecoderBlock, UnetDecoder};
pub use unet::{weights_recorder, StrokeUNet, StrokeUNetRecord};

/// Nearest-neighbour upsampling by an integer factor.
///
/// Shared by the model and the graph runtime so that both produce identical
/// values.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, scale: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    interpolate(
        x,
        [h * scale, w * scale],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}
