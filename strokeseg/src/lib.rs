//! # strokeseg
//!
//! Brain stroke CT segmentation with Burn: a ResNet-encoder U-Net trained
//! against a BCE + Dice objective, exported to an ONNX graph and a
//! precision-compiled engine, and served from any of the three through one
//! inference interface.
//!
//! ## Modules
//!
//! - [`data`]: dataset discovery, augmentation and batching
//! - [`models`]: the segmentation network
//! - [`losses`] and [`metrics`]: training objective and agreement metrics
//! - [`training`]: the epoch loop, checkpoints and history
//! - [`export`]: checkpoint → graph → engine conversion with parity checks
//! - [`inference`]: backend-polymorphic prediction

pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod inference;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod training;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ModelConfig, MonitoredMetric, Precision, PreprocessConfig, ResNetDepth};
pub use error::{StrokeSegError, StrokeSegResult};
pub use export::{build_engine, export_graph, ArtifactStore, EngineBuildConfig, ExportConfig};
pub use inference::{BackendKind, InferenceEngine, ModelArtifact, PredictionResult};
pub use models::StrokeUNet;
pub use training::{train, Checkpoint, TrainingConfig, TrainingSummary};
