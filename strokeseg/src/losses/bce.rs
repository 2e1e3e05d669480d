//! Binary cross-entropy on logits.

use core::marker::PhantomData;

use burn::{prelude::*, tensor::Tensor};

/// Configuration for [`BceWithLogitsLoss`].
#[derive(Config, Debug)]
pub struct BceWithLogitsLossConfig {}

impl BceWithLogitsLossConfig {
    pub const fn init<B: Backend>(&self) -> BceWithLogitsLoss<B> {
        BceWithLogitsLoss {
            _phantom: PhantomData,
        }
    }
}

/// Mean binary cross-entropy computed directly from logits.
///
/// Uses the numerically stable form `max(x, 0) - x*y + ln(1 + e^{-|x|})`,
/// which never evaluates `exp` of a positive number.
#[derive(Module, Debug)]
pub struct BceWithLogitsLoss<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> Default for BceWithLogitsLoss<B> {
    fn default() -> Self {
        BceWithLogitsLossConfig::new().init()
    }
}

impl<B: Backend> BceWithLogitsLoss<B> {
    /// # Shapes
    /// - logits: `[N, H, W]`
    /// - targets: `[N, H, W]`, values in `{0, 1}`
    /// - output: `[1]`
    pub fn forward(&self, logits: Tensor<B, 3>, targets: Tensor<B, 3>) -> Tensor<B, 1> {
        let positive_part = logits.clone().clamp_min(0.0);
        let log_term = logits.clone().abs().neg().exp().add_scalar(1.0).log();

        (positive_part - logits * targets + log_term).mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBackend;

    #[test]
    fn matches_reference_values() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::from_floats([[[0.0, 2.0], [-3.0, 50.0]]], &device);
        let targets = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [0.0, 1.0]]], &device);

        let loss: f32 = BceWithLogitsLoss::default()
            .forward(logits, targets)
            .into_scalar();

        // ln 2, 2 + ln(1 + e^-2), ln(1 + e^-3), ~0
        let expected = (2f32.ln() + 2.0 + (1.0 + (-2f32).exp()).ln() + (1.0 + (-3f32).exp()).ln()) / 4.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn stays_finite_for_extreme_logits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::from_floats([[[1e4, -1e4]]], &device);
        let targets = Tensor::<TestBackend, 3>::from_floats([[[0.0, 1.0]]], &device);

        let loss: f32 = BceWithLogitsLoss::default()
            .forward(logits, targets)
            .into_scalar();
        assert!(loss.is_finite());
        assert!((loss - 1e4).abs() < 1.0);
    }
}
