//! Half-precision emulation for backends that compute in `f32`.
//!
//! Rounding every value through IEEE binary16 reproduces the numerical
//! behaviour of an fp16 kernel (range, subnormals and round-to-nearest-even)
//! without requiring half-precision support from the backend itself.

use burn::{
    prelude::*,
    tensor::{f16, TensorData},
};

/// Rounds a single value to the nearest representable `f16`.
#[inline]
pub fn round_f32_to_half(value: f32) -> f32 {
    f16::from_f32(value).to_f32()
}

/// Rounds every value of the slice in place.
pub fn round_slice_to_half(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = round_f32_to_half(*v);
    }
}

/// Packs `f32` values into `f16` bit patterns.
pub fn pack_half(values: &[f32]) -> Vec<u16> {
    values.iter().map(|&v| f16::from_f32(v).to_bits()).collect()
}

/// Expands `f16` bit patterns back to `f32`.
pub fn unpack_half(bits: &[u16]) -> Vec<f32> {
    bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect()
}

/// Rounds every element of `tensor` to `f16` precision, keeping its dtype.
///
/// The data makes a round trip through host memory.
pub fn round_to_half<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    let device = tensor.device();
    let shape = tensor.dims();
    let data = tensor.into_data();
    let values: Vec<f32> = data.iter::<f32>().map(round_f32_to_half).collect();

    Tensor::from_data(TensorData::new(values, shape), &device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_round_to_half_exact_values_unchanged() {
        for v in [0.0f32, 1.0, -2.5, 0.5, 1024.0] {
            assert_eq!(round_f32_to_half(v), v);
        }
    }

    #[test]
    fn test_round_to_half_loses_mantissa() {
        let v = 1.0f32 + 1e-4;
        let rounded = round_f32_to_half(v);
        assert_eq!(rounded, 1.0);
        assert!((round_f32_to_half(0.1) - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_round_to_half_overflow_saturates_to_infinity() {
        assert!(round_f32_to_half(1e6).is_infinite());
    }

    #[test]
    fn test_pack_unpack_half() {
        let values = [0.25f32, -3.0, 65504.0];
        let bits = pack_half(&values);
        assert_eq!(unpack_half(&bits), values.to_vec());
    }

    #[test]
    fn test_round_tensor_preserves_shape() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0001, 2.0], [3.0, 0.333_333]]],
            &device,
        );
        let rounded = round_to_half(tensor);

        assert_eq!(rounded.dims(), [1, 2, 2]);
        let values: Vec<f32> = rounded.into_data().iter::<f32>().collect();
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], 2.0);
        assert!((values[3] - 0.333_333).abs() < 1e-3);
    }
}
