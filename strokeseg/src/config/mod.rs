//! Configuration module for strokeseg.
//!
//! - `core`: model and preprocessing configuration structures
//! - `enums`: enumeration types used in configurations

pub mod core;
pub mod enums;

pub use self::core::{
    ModelConfig, NormalizationConfig, PreprocessConfig, DECODER_STAGES, OUTPUT_STRIDE,
};
pub use enums::{MonitoredMetric, Precision, ResNetDepth, ResizeMode};
