//! Backend-polymorphic inference.
//!
//! A [`ModelArtifact`] names a checkpoint, graph or engine; loading it yields
//! a [`SegmentationBackend`] that [`InferenceEngine`] drives. Preprocessing,
//! the sigmoid, thresholding and confidence are shared by all three, so
//! results differ only by the numerical drift of the backend itself.

pub mod artifact;
pub mod backend;
pub mod predictor;
pub mod result;
pub mod visualization;

pub use artifact::ModelArtifact;
pub use backend::{BackendKind, CheckpointBackend, EngineBackend, GraphBackend, SegmentationBackend};
pub use predictor::InferenceEngine;
pub use result::PredictionResult;
pub use visualization::{render_panels, save_panels};
