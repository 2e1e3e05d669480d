//! Per-epoch training record, written next to the checkpoint.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{StrokeSegError, StrokeSegResult},
    metrics::SegmentationMetrics,
};

/// What happened in one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    /// Loss of every optimised batch, in loader order.
    pub train_batch_losses: Vec<f32>,
    pub train_loss: f64,
    pub train_dice: f64,
    pub train_iou: f64,
    /// Batches whose update was skipped because the loss was not finite.
    pub skipped_batches: usize,
    pub val_loss: f64,
    pub val: SegmentationMetrics,
    /// Whether this epoch produced a new best checkpoint.
    pub improved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Every training batch loss of the run, in order.
    pub fn loss_trajectory(&self) -> Vec<f32> {
        self.epochs
            .iter()
            .flat_map(|e| e.train_batch_losses.iter().copied())
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> StrokeSegResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StrokeSegError::serialization("training history", e))?;
        fs::write(path, json).map_err(|e| StrokeSegError::io(path, e))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> StrokeSegResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| StrokeSegError::io(path, e))?;
        serde_json::from_str(&json)
            .map_err(|e| StrokeSegError::serialization(format!("{}", path.display()), e))
    }
}
