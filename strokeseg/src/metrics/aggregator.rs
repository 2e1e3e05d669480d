//! Epoch-level averaging of loss and per-sample metrics.

use super::confusion::SegmentationMetrics;

/// Running means over an epoch.
///
/// Metrics are averaged per sample. Loss is averaged per sample as well,
/// weighting each batch mean by its batch size, so a short final batch does
/// not skew the epoch value.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    sum: SegmentationMetrics,
    samples: usize,
    loss_sum: f64,
    loss_samples: usize,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, metrics: &SegmentationMetrics) {
        self.sum.dice += metrics.dice;
        self.sum.iou += metrics.iou;
        self.sum.sensitivity += metrics.sensitivity;
        self.sum.specificity += metrics.specificity;
        self.sum.accuracy += metrics.accuracy;
        self.samples += 1;
    }

    pub fn extend<'a>(&mut self, metrics: impl IntoIterator<Item = &'a SegmentationMetrics>) {
        for m in metrics {
            self.update(m);
        }
    }

    /// Records the mean loss of a batch of `batch_size` samples.
    pub fn update_loss(&mut self, loss: f64, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.loss_samples += batch_size;
    }

    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Mean metrics, or all zeros when nothing was recorded.
    pub fn value(&self) -> SegmentationMetrics {
        if self.samples == 0 {
            return SegmentationMetrics::default();
        }
        let n = self.samples as f64;
        SegmentationMetrics {
            dice: self.sum.dice / n,
            iou: self.sum.iou / n,
            sensitivity: self.sum.sensitivity / n,
            specificity: self.sum.specificity / n,
            accuracy: self.sum.accuracy / n,
        }
    }

    /// Mean loss, or `NaN` when no finite batch was recorded.
    pub fn loss(&self) -> f64 {
        if self.loss_samples == 0 {
            return f64::NAN;
        }
        self.loss_sum / self.loss_samples as f64
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_per_sample() {
        let mut acc = MetricsAccumulator::new();
        acc.update(&SegmentationMetrics {
            dice: 1.0,
            iou: 1.0,
            sensitivity: 1.0,
            specificity: 0.5,
            accuracy: 1.0,
        });
        acc.update(&SegmentationMetrics::default());

        let mean = acc.value();
        assert_eq!(acc.samples(), 2);
        assert_eq!(mean.dice, 0.5);
        assert_eq!(mean.specificity, 0.25);
    }

    #[test]
    fn loss_is_weighted_by_batch_size() {
        let mut acc = MetricsAccumulator::new();
        acc.update_loss(1.0, 3);
        acc.update_loss(0.0, 1);
        assert!((acc.loss() - 0.75).abs() < 1e-12);

        acc.clear();
        assert!(acc.loss().is_nan());
        assert_eq!(acc.value(), SegmentationMetrics::default());
    }
}
