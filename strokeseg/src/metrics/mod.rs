//! Evaluation metrics for binary lesion masks.

pub mod aggregator;
pub mod confusion;

pub use aggregator::MetricsAccumulator;
pub use confusion::{batch_metrics, ConfusionCounts, SegmentationMetrics};
