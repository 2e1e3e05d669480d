//! Sample discovery, augmentation and batching.

pub mod augmentation;
pub mod batcher;
pub mod dataset;
pub mod mask;

pub use augmentation::{AugmentationConfig, Augmentor, TransformMode, TransformedSample};
pub use batcher::{StrokeBatch, StrokeBatcher, StrokeItem};
pub use dataset::{scan_dataset, split_samples, Sample, SampleSource, StrokeDataset};
pub use mask::{extract_lesion_mask, load_overlay_mask};
