//! Weighted BCE + Dice objective used for training.

use burn::{prelude::*, tensor::activation::sigmoid};

use super::{
    bce::{BceWithLogitsLoss, BceWithLogitsLossConfig},
    dice::{DiceLoss, DiceLossConfig},
};
use crate::error::{StrokeSegError, StrokeSegResult};

/// Configuration for [`CompositeLoss`].
#[derive(Config, Debug)]
pub struct CompositeLossConfig {
    #[config(default = 0.5)]
    pub bce_weight: f32,
    #[config(default = 0.5)]
    pub dice_weight: f32,
    #[config(default = 1e-6)]
    pub smooth: f32,
}

impl CompositeLossConfig {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for negative
    /// weights, weights that sum to zero, or a non-positive smoothing term.
    pub fn validate(&self) -> StrokeSegResult<()> {
        let invalid = |reason: String| Err(StrokeSegError::InvalidConfiguration { reason });

        if !(self.bce_weight >= 0.0 && self.dice_weight >= 0.0) {
            return invalid(format!(
                "loss weights must be non-negative, got bce={} dice={}",
                self.bce_weight, self.dice_weight
            ));
        }
        if self.bce_weight + self.dice_weight <= 0.0 {
            return invalid("at least one loss weight must be positive".to_owned());
        }
        if !(self.smooth > 0.0) {
            return invalid(format!("dice smoothing must be positive, got {}", self.smooth));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self) -> CompositeLoss<B> {
        CompositeLoss {
            bce_weight: self.bce_weight,
            dice_weight: self.dice_weight,
            bce: BceWithLogitsLossConfig::new().init(),
            dice: DiceLossConfig::new().with_smooth(self.smooth).init(),
        }
    }
}

/// `bce_weight · BCE(logits, y) + dice_weight · (1 − Dice(σ(logits), y))`.
#[derive(Module, Debug)]
pub struct CompositeLoss<B: Backend> {
    pub bce_weight: f32,
    pub dice_weight: f32,
    bce: BceWithLogitsLoss<B>,
    dice: DiceLoss<B>,
}

impl<B: Backend> Default for CompositeLoss<B> {
    fn default() -> Self {
        CompositeLossConfig::new().init()
    }
}

impl<B: Backend> CompositeLoss<B> {
    /// # Shapes
    /// - logits: `[N, H, W]`
    /// - targets: `[N, H, W]`
    /// - output: `[1]`
    pub fn forward(&self, logits: Tensor<B, 3>, targets: Tensor<B, 3>) -> Tensor<B, 1> {
        let bce = self.bce.forward(logits.clone(), targets.clone());
        let dice = self.dice.forward(sigmoid(logits), targets);

        bce.mul_scalar(self.bce_weight) + dice.mul_scalar(self.dice_weight)
    }
}
