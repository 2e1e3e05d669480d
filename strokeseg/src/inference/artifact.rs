use std::path::{Path, PathBuf};

use burn::prelude::*;

use super::backend::{
    BackendKind, CheckpointBackend, EngineBackend, GraphBackend, SegmentationBackend,
};
use crate::error::StrokeSegResult;

/// A servable model. Only `Checkpoint` is a source of truth; the other two
/// are derived from one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelArtifact {
    /// A checkpoint directory.
    Checkpoint(PathBuf),
    /// An ONNX graph file.
    Graph(PathBuf),
    /// A `.sse` engine file.
    Engine(PathBuf),
}

impl ModelArtifact {
    pub fn new(kind: BackendKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match kind {
            BackendKind::Checkpoint => Self::Checkpoint(path),
            BackendKind::Graph => Self::Graph(path),
            BackendKind::Engine => Self::Engine(path),
        }
    }

    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Checkpoint(_) => BackendKind::Checkpoint,
            Self::Graph(_) => BackendKind::Graph,
            Self::Engine(_) => BackendKind::Engine,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Checkpoint(p) | Self::Graph(p) | Self::Engine(p) => p,
        }
    }

    /// Opens the backend matching the artifact's kind.
    ///
    /// # Errors
    ///
    /// Returns the loading errors of the selected backend.
    pub fn load<B: Backend>(
        &self,
        device: &B::Device,
    ) -> StrokeSegResult<Box<dyn SegmentationBackend<B>>> {
        tracing::info!(kind = %self.kind(), path = %self.path().display(), "loading artifact");
        Ok(match self {
            Self::Checkpoint(dir) => Box::new(CheckpointBackend::open(dir, device)?),
            Self::Graph(path) => Box::new(GraphBackend::open(path)?),
            Self::Engine(path) => Box::new(EngineBackend::open(path, device)?),
        })
    }
}
