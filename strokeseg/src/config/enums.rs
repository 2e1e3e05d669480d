//! Enumeration types for strokeseg configuration.

use core::{fmt, str::FromStr};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

pub use resnet::ResNetDepth;

/// How an image whose aspect ratio differs from the model input is resized.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Resize straight to the target size, distorting the aspect ratio.
    Stretch,
    /// Fit inside the target size and pad the remainder with zeros.
    Letterbox,
}

/// Numeric precision of a compiled engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    Fp32,
    Fp16,
}

impl Precision {
    /// Bytes per activation element.
    pub const fn element_bytes(&self) -> u64 {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 => 2,
        }
    }

    /// Short lowercase name used in file names and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" => Ok(Self::Fp32),
            "fp16" | "f16" | "half" => Ok(Self::Fp16),
            other => Err(format!("unknown precision '{other}', expected fp32 or fp16")),
        }
    }
}

/// Validation quantity that decides whether a checkpoint is the new best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoredMetric {
    /// Mean validation Dice, higher is better.
    Dice,
    /// Mean validation IoU, higher is better.
    Iou,
    /// Mean validation loss, lower is better.
    ValLoss,
}

impl MonitoredMetric {
    /// Whether `candidate` strictly improves on `best`.
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            Self::Dice | Self::Iou => candidate > best,
            Self::ValLoss => candidate < best,
        }
    }
}

impl fmt::Display for MonitoredMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dice => "val_dice",
            Self::Iou => "val_iou",
            Self::ValLoss => "val_loss",
        };
        f.write_str(name)
    }
}
