//! Reduce-on-plateau learning-rate schedule.

use burn::prelude::*;

use crate::{
    config::MonitoredMetric,
    error::{StrokeSegError, StrokeSegResult},
};

/// Configuration for [`PlateauScheduler`].
#[derive(Config, Debug)]
pub struct PlateauSchedulerConfig {
    /// Multiplier applied to the learning rate on a plateau.
    #[config(default = 0.5)]
    pub factor: f64,
    /// Non-improving epochs tolerated before reducing.
    #[config(default = 8)]
    pub patience: usize,
    /// The learning rate never drops below this value.
    #[config(default = 1e-7)]
    pub min_lr: f64,
    /// Relative change that counts as an improvement.
    #[config(default = 1e-4)]
    pub threshold: f64,
}

impl PlateauSchedulerConfig {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` unless
    /// `0 < factor < 1`, `min_lr >= 0` and `threshold >= 0`.
    pub fn validate(&self) -> StrokeSegResult<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!("scheduler factor must lie in (0, 1), got {}", self.factor),
            });
        }
        if !(self.min_lr >= 0.0 && self.threshold >= 0.0) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "scheduler min_lr and threshold must be non-negative, got {} and {}",
                    self.min_lr, self.threshold
                ),
            });
        }
        Ok(())
    }

    pub const fn init(&self, initial_lr: f64, metric: MonitoredMetric) -> PlateauScheduler {
        PlateauScheduler {
            factor: self.factor,
            patience: self.patience,
            min_lr: self.min_lr,
            threshold: self.threshold,
            metric,
            lr: initial_lr,
            best: None,
            bad_epochs: 0,
        }
    }
}

/// Halves (by default) the learning rate when the monitored validation value
/// has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    min_lr: f64,
    threshold: f64,
    metric: MonitoredMetric,
    lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub const fn lr(&self) -> f64 {
        self.lr
    }

    fn is_better(&self, value: f64, best: f64) -> bool {
        match self.metric {
            MonitoredMetric::Dice | MonitoredMetric::Iou => {
                value > best + best.abs() * self.threshold
            }
            MonitoredMetric::ValLoss => value < best - best.abs() * self.threshold,
        }
    }

    /// Records an epoch's validation value and returns the learning rate for
    /// the next epoch. Non-finite values count as non-improving.
    pub fn step(&mut self, value: f64) -> f64 {
        let improved = value.is_finite()
            && match self.best {
                None => true,
                Some(best) => self.is_better(value, best),
            };

        if improved {
            self.best = Some(value);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if reduced < self.lr {
                tracing::info!(from = self.lr, to = reduced, "reducing learning rate");
                self.lr = reduced;
            }
            self.bad_epochs = 0;
        }

        self.lr
    }
}
