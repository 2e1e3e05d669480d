//! The three execution backends behind one capability trait.

use core::{fmt, str::FromStr};
use std::path::Path;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::PreprocessConfig,
    error::{StrokeSegError, StrokeSegResult},
    export::{Engine, EngineRuntime, Graph, OnnxRuntime},
    models::StrokeUNet,
    training::Checkpoint,
};

/// Which kind of artifact produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Checkpoint,
    Graph,
    Engine,
}

impl BackendKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Graph => "graph",
            Self::Engine => "engine",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "checkpoint" => Ok(Self::Checkpoint),
            "graph" => Ok(Self::Graph),
            "engine" => Ok(Self::Engine),
            other => Err(format!(
                "unknown artifact kind '{other}', expected checkpoint, graph or engine"
            )),
        }
    }
}

/// Turns a fixed-size `[N, 3, H, W]` batch into `[N, H, W]` logits.
pub trait SegmentationBackend<B: Backend>: Send {
    fn kind(&self) -> BackendKind;

    /// `[H, W]` the backend expects.
    fn input_size(&self) -> [usize; 2];

    /// Preprocessing the backend was trained or exported with.
    fn preprocess(&self) -> &PreprocessConfig;

    /// Largest batch accepted by one [`SegmentationBackend::logits`] call, or
    /// `None` when any batch size works.
    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    /// # Errors
    ///
    /// Backend-specific; engines reject batches above their compiled size.
    fn logits(&self, images: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 3>>;
}

/// The trained model itself.
#[derive(Debug)]
pub struct CheckpointBackend<B: Backend> {
    model: StrokeUNet<B>,
    preprocess: PreprocessConfig,
    input_size: [usize; 2],
}

impl<B: Backend> CheckpointBackend<B> {
    /// # Errors
    ///
    /// Returns checkpoint validation and record errors.
    pub fn open(dir: &Path, device: &B::Device) -> StrokeSegResult<Self> {
        let checkpoint = Checkpoint::open(dir)?;
        let metadata = checkpoint.metadata();
        Ok(Self {
            model: checkpoint.load_model(device)?,
            preprocess: metadata.preprocess.clone(),
            input_size: [metadata.model.image_height, metadata.model.image_width],
        })
    }
}

impl<B: Backend> SegmentationBackend<B> for CheckpointBackend<B> {
    fn kind(&self) -> BackendKind {
        BackendKind::Checkpoint
    }

    fn input_size(&self) -> [usize; 2] {
        self.input_size
    }

    fn preprocess(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    fn logits(&self, images: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 3>> {
        Ok(self.model.forward(images))
    }
}

/// An ONNX graph executed by ONNX Runtime.
///
/// Inputs and logits cross to the host on every call, so this works with
/// any Burn backend.
#[derive(Debug)]
pub struct GraphBackend {
    runtime: OnnxRuntime,
    preprocess: PreprocessConfig,
    input_size: [usize; 2],
}

impl GraphBackend {
    /// # Errors
    ///
    /// Returns I/O, `ArtifactFormat` and `GraphRuntime` errors.
    pub fn open(path: &Path) -> StrokeSegResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| StrokeSegError::io(path, e))?;
        let graph = Graph::from_bytes(&bytes, path)?;
        Ok(Self {
            runtime: OnnxRuntime::from_bytes(&bytes, graph.item_shape(), path)?,
            preprocess: graph.header.preprocess,
            input_size: [graph.header.input_height, graph.header.input_width],
        })
    }
}

impl<B: Backend> SegmentationBackend<B> for GraphBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn input_size(&self) -> [usize; 2] {
        self.input_size
    }

    fn preprocess(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    fn logits(&self, images: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 3>> {
        Ok(self.runtime.forward(images)?.squeeze::<3>(1))
    }
}

/// A compiled engine executed by [`EngineRuntime`].
#[derive(Debug)]
pub struct EngineBackend<B: Backend> {
    runtime: EngineRuntime<B>,
    preprocess: PreprocessConfig,
    input_size: [usize; 2],
}

impl<B: Backend> EngineBackend<B> {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::IncompatibleEngine)` for engines built on
    /// another platform, plus I/O and `ArtifactFormat` errors.
    pub fn open(path: &Path, device: &B::Device) -> StrokeSegResult<Self> {
        let engine = Engine::read(path)?;
        Ok(Self {
            runtime: EngineRuntime::new(&engine, path.to_path_buf(), device)?,
            preprocess: engine.header.preprocess.clone(),
            input_size: engine.input_size(),
        })
    }
}

impl<B: Backend> SegmentationBackend<B> for EngineBackend<B> {
    fn kind(&self) -> BackendKind {
        BackendKind::Engine
    }

    fn input_size(&self) -> [usize; 2] {
        self.input_size
    }

    fn preprocess(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    fn max_batch_size(&self) -> Option<usize> {
        Some(self.runtime.max_batch_size())
    }

    fn logits(&self, images: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 3>> {
        Ok(self.runtime.forward(images)?.squeeze::<3>(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Graph".parse::<BackendKind>().unwrap(), BackendKind::Graph);
        assert_eq!("engine".parse::<BackendKind>().unwrap(), BackendKind::Engine);
        assert!("onnx".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Checkpoint.to_string(), "checkpoint");
    }
}
