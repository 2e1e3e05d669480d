//! Numerical agreement between an artifact and the artifact it was derived
//! from.

use burn::{prelude::*, tensor::TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::Precision,
    error::{StrokeSegError, StrokeSegResult},
};

/// Deterministic `[N, C, H, W]` probe input with values in `[-2, 2]`.
pub fn probe_batch<B: Backend>(
    batch: usize,
    shape: [usize; 3],
    seed: u64,
    device: &B::Device,
) -> Tensor<B, 4> {
    let mut rng = StdRng::seed_from_u64(seed);
    let [c, h, w] = shape;
    let values: Vec<f32> = (0..batch * c * h * w)
        .map(|_| rng.random_range(-2.0..=2.0))
        .collect();
    Tensor::from_data(TensorData::new(values, [batch, c, h, w]), device)
}

/// Differences between two sets of logits after the sigmoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParityReport {
    /// Largest `|p_reference - p_candidate|`; infinite if either side is NaN.
    pub max_abs_diff: f32,
    /// Fraction of pixels whose thresholded masks differ.
    pub mask_disagreement: f32,
    pub pixels: usize,
}

impl ParityReport {
    /// Compares two flattened logit buffers of the same length.
    pub fn compare(reference: &[f32], candidate: &[f32], threshold: f32) -> Self {
        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let mut max_abs_diff = if reference.len() == candidate.len() {
            0.0f32
        } else {
            f32::INFINITY
        };
        let mut disagreements = 0usize;

        for (&a, &b) in reference.iter().zip(candidate) {
            let (pa, pb) = (sigmoid(a), sigmoid(b));
            let diff = (pa - pb).abs();
            max_abs_diff = if diff.is_nan() {
                f32::INFINITY
            } else {
                max_abs_diff.max(diff)
            };
            if (pa >= threshold) != (pb >= threshold) {
                disagreements += 1;
            }
        }

        let pixels = reference.len().min(candidate.len());
        Self {
            max_abs_diff,
            mask_disagreement: if pixels == 0 {
                0.0
            } else {
                disagreements as f32 / pixels as f32
            },
            pixels,
        }
    }

    /// Merges the report of a further probe chunk.
    pub fn merge(self, other: Self) -> Self {
        let pixels = self.pixels + other.pixels;
        let disagreeing = self.mask_disagreement * self.pixels as f32
            + other.mask_disagreement * other.pixels as f32;
        Self {
            max_abs_diff: self.max_abs_diff.max(other.max_abs_diff),
            mask_disagreement: if pixels == 0 {
                0.0
            } else {
                disagreeing / pixels as f32
            },
            pixels,
        }
    }

    pub fn within(&self, epsilon: f32, max_mask_disagreement: f32) -> bool {
        self.max_abs_diff <= epsilon && self.mask_disagreement <= max_mask_disagreement
    }

    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ConversionMismatch)` outside the bounds.
    pub fn check(
        &self,
        epsilon: f32,
        max_mask_disagreement: f32,
        source_hash: &str,
        target: &str,
        precision: Precision,
    ) -> StrokeSegResult<()> {
        if self.within(epsilon, max_mask_disagreement) {
            tracing::info!(
                target,
                %precision,
                max_abs_diff = self.max_abs_diff,
                mask_disagreement = self.mask_disagreement,
                "parity check passed"
            );
            return Ok(());
        }
        Err(StrokeSegError::ConversionMismatch {
            source_hash: source_hash.to_owned(),
            target: target.to_owned(),
            precision,
            max_abs_diff: self.max_abs_diff,
            epsilon,
            mask_disagreement: self.mask_disagreement,
        })
    }
}

/// Host copy of a logits tensor.
pub fn host_logits<B: Backend, const D: usize>(logits: Tensor<B, D>) -> Vec<f32> {
    logits.into_data().iter::<f32>().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBackend;

    #[test]
    fn parity_batch_is_seeded() {
        let device = Default::default();
        let a = host_logits(probe_batch::<TestBackend>(2, [3, 4, 4], 7, &device));
        let b = host_logits(probe_batch::<TestBackend>(2, [3, 4, 4], 7, &device));
        let c = host_logits(probe_batch::<TestBackend>(2, [3, 4, 4], 8, &device));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| (-2.0..=2.0).contains(v)));
    }

    #[test]
    fn identical_logits_agree() {
        let logits = [-3.0, 0.0, 0.5, 4.0];
        let report = ParityReport::compare(&logits, &logits, 0.5);
        assert_eq!(report.max_abs_diff, 0.0);
        assert_eq!(report.mask_disagreement, 0.0);
        assert!(report.check(1e-3, 0.01, "h", "graph", Precision::Fp32).is_ok());
    }

    #[test]
    fn threshold_crossings_count_as_disagreement() {
        // sigmoid(0) = 0.5 sits exactly on the threshold and counts as positive.
        let report = ParityReport::compare(&[0.0, 2.0], &[-0.01, 2.0], 0.5);
        assert_eq!(report.mask_disagreement, 0.5);
        assert!(report.max_abs_diff < 1e-2);

        let err = report
            .check(1e-2, 0.01, "h", "engine", Precision::Fp16)
            .unwrap_err();
        assert!(matches!(
            err,
            StrokeSegError::ConversionMismatch {
                precision: Precision::Fp16,
                ..
            }
        ));
    }

    #[test]
    fn nan_is_never_within_tolerance() {
        let report = ParityReport::compare(&[1.0], &[f32::NAN], 0.5);
        assert!(report.max_abs_diff.is_infinite());
        assert!(!report.within(1.0, 1.0));
    }

    #[test]
    fn merge_weights_by_pixels() {
        let a = ParityReport::compare(&[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0], 0.5);
        let b = ParityReport::compare(&[1.0], &[-1.0], 0.5);
        let merged = a.merge(b);
        assert_eq!(merged.pixels, 4);
        assert!((merged.mask_disagreement - 0.25).abs() < 1e-6);
    }
}
