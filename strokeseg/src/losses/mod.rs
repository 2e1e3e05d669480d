//! Training objectives.

pub mod bce;
pub mod composite;
pub mod dice;

pub use bce::{BceWithLogitsLoss, BceWithLogitsLossConfig};
pub use composite::{CompositeLoss, CompositeLossConfig};
pub use dice::{DiceLoss, DiceLossConfig};
