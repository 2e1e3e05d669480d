//! Additional operations for the Burn deep learning framework
//!
//! This crate provides operations that are commonly used in deep learning but are not
//! yet available in the core Burn framework.

use burn::prelude::*;

mod precision;

pub use precision::{
    pack_half, round_f32_to_half, round_slice_to_half, round_to_half, unpack_half,
};

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend, const D: usize> {
    /// Round every element to half precision while keeping the tensor's dtype.
    fn round_to_half(self) -> Self;
}

impl<B: Backend, const D: usize> TensorExtraOps<B, D> for Tensor<B, D> {
    fn round_to_half(self) -> Self {
        precision::round_to_half(self)
    }
}
