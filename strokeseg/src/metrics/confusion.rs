//! Pixel-level agreement metrics between a thresholded prediction and a mask.
//!
//! Everything here runs on the host so that the checkpoint, graph and engine
//! backends are scored by the same code.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Pixel counts of a binary prediction against a binary ground truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub true_negative: u64,
    pub false_negative: u64,
}

impl ConfusionCounts {
    /// Counts pixels where the prediction is positive iff `p >= threshold`
    /// and the target is positive iff `y >= 0.5`.
    pub fn from_probabilities(probabilities: &[f32], targets: &[f32], threshold: f32) -> Self {
        debug_assert_eq!(probabilities.len(), targets.len());

        let mut counts = Self::default();
        for (&p, &y) in probabilities.iter().zip(targets) {
            match (p >= threshold, y >= 0.5) {
                (true, true) => counts.true_positive += 1,
                (true, false) => counts.false_positive += 1,
                (false, false) => counts.true_negative += 1,
                (false, true) => counts.false_negative += 1,
            }
        }
        counts
    }

    pub const fn total(&self) -> u64 {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    /// `2|A∩B| / (|A|+|B|)`; two empty masks agree perfectly.
    pub fn dice(&self) -> f64 {
        let denominator = 2 * self.true_positive + self.false_positive + self.false_negative;
        if denominator == 0 {
            return 1.0;
        }
        (2 * self.true_positive) as f64 / denominator as f64
    }

    /// `|A∩B| / |A∪B|`; two empty masks agree perfectly.
    pub fn iou(&self) -> f64 {
        let union = self.true_positive + self.false_positive + self.false_negative;
        if union == 0 {
            return 1.0;
        }
        self.true_positive as f64 / union as f64
    }

    /// Recall of the lesion class; 0 when the ground truth has no lesion.
    pub fn sensitivity(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    /// Recall of the background class; 0 when there is no background.
    pub fn specificity(&self) -> f64 {
        ratio(self.true_negative, self.true_negative + self.false_positive)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }
}

impl core::ops::Add for ConfusionCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            true_positive: self.true_positive + rhs.true_positive,
            false_positive: self.false_positive + rhs.false_positive,
            true_negative: self.true_negative + rhs.true_negative,
            false_negative: self.false_negative + rhs.false_negative,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Metrics of one sample, or their mean over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    pub dice: f64,
    pub iou: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub accuracy: f64,
}

impl From<ConfusionCounts> for SegmentationMetrics {
    fn from(counts: ConfusionCounts) -> Self {
        Self {
            dice: counts.dice(),
            iou: counts.iou(),
            sensitivity: counts.sensitivity(),
            specificity: counts.specificity(),
            accuracy: counts.accuracy(),
        }
    }
}

impl SegmentationMetrics {
    /// Scores a single `H×W` probability map against its mask.
    pub fn from_probabilities(probabilities: &[f32], targets: &[f32], threshold: f32) -> Self {
        ConfusionCounts::from_probabilities(probabilities, targets, threshold).into()
    }
}

/// Per-sample metrics for a batch of probability maps.
///
/// # Shapes
/// - probabilities: `[N, H, W]`
/// - targets: `[N, H, W]`
pub fn batch_metrics<B: Backend>(
    probabilities: Tensor<B, 3>,
    targets: Tensor<B, 3>,
    threshold: f32,
) -> Vec<SegmentationMetrics> {
    let [n, h, w] = probabilities.dims();
    let pixels = h * w;

    let probabilities: Vec<f32> = probabilities.into_data().iter::<f32>().collect();
    let targets: Vec<f32> = targets.into_data().iter::<f32>().collect();

    (0..n)
        .map(|i| {
            let range = i * pixels..(i + 1) * pixels;
            SegmentationMetrics::from_probabilities(
                &probabilities[range.clone()],
                &targets[range],
                threshold,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBackend;

    #[test]
    fn identical_masks_score_one() {
        let mask = [1.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        let metrics = SegmentationMetrics::from_probabilities(&mask, &mask, 0.5);
        assert_eq!(metrics.dice, 1.0);
        assert_eq!(metrics.iou, 1.0);
        assert_eq!(metrics.sensitivity, 1.0);
        assert_eq!(metrics.specificity, 1.0);
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[test]
    fn disjoint_masks_score_exactly_zero() {
        let prediction = [1.0, 1.0, 0.0, 0.0];
        let target = [0.0, 0.0, 1.0, 0.0];
        let metrics = SegmentationMetrics::from_probabilities(&prediction, &target, 0.5);
        assert_eq!(metrics.dice, 0.0);
        assert_eq!(metrics.iou, 0.0);
        assert_eq!(metrics.sensitivity, 0.0);
    }

    #[test]
    fn empty_masks_follow_conventions() {
        let zeros = [0.0; 16];
        let metrics = SegmentationMetrics::from_probabilities(&zeros, &zeros, 0.5);
        assert_eq!(metrics.dice, 1.0);
        assert_eq!(metrics.iou, 1.0);
        assert_eq!(metrics.sensitivity, 0.0);
        assert_eq!(metrics.specificity, 1.0);

        let ones = [1.0; 16];
        let metrics = SegmentationMetrics::from_probabilities(&ones, &ones, 0.5);
        assert_eq!(metrics.specificity, 0.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let counts = ConfusionCounts::from_probabilities(&[0.5, 0.4999], &[1.0, 1.0], 0.5);
        assert_eq!(counts.true_positive, 1);
        assert_eq!(counts.false_negative, 1);
    }

    #[test]
    fn values_lie_in_unit_interval() {
        let prediction = [0.9, 0.2, 0.7, 0.1, 0.6, 0.3, 0.8, 0.05];
        let target = [1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        for threshold in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let m = SegmentationMetrics::from_probabilities(&prediction, &target, threshold);
            for value in [m.dice, m.iou, m.sensitivity, m.specificity, m.accuracy] {
                assert!((0.0..=1.0).contains(&value), "{value} at {threshold}");
            }
        }
    }

    #[test]
    fn partial_overlap() {
        // tp=2, fp=1, fn=1, tn=4
        let prediction = [1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let target = [1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let m = SegmentationMetrics::from_probabilities(&prediction, &target, 0.5);
        assert!((m.dice - 4.0 / 6.0).abs() < 1e-12);
        assert!((m.iou - 0.5).abs() < 1e-12);
        assert!((m.sensitivity - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.specificity - 0.8).abs() < 1e-12);
        assert!((m.accuracy - 0.75).abs() < 1e-12);
    }

    #[test]
    fn batch_metrics_are_per_sample() {
        let device = Default::default();
        let probabilities =
            Tensor::<TestBackend, 3>::from_floats([[[0.9, 0.1]], [[0.9, 0.1]]], &device);
        let targets = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0]], [[0.0, 1.0]]], &device);

        let metrics = batch_metrics(probabilities, targets, 0.5);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].dice, 1.0);
        assert_eq!(metrics[1].dice, 0.0);
    }
}
