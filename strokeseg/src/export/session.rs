//! ONNX Runtime execution of exported graphs.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use burn::{prelude::*, tensor::TensorData};
use ort::{
    execution_providers::CPUExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor as OrtTensor,
};

use super::{
    graph::Graph,
    onnx::{INPUT_NAME, OUTPUT_NAME},
};
use crate::error::{StrokeSegError, StrokeSegResult};

/// An ONNX Runtime session over a graph file.
///
/// `Session::run` needs exclusive access, so calls are serialised.
pub struct OnnxRuntime {
    session: Mutex<Session>,
    input_shape: [usize; 3],
    origin: PathBuf,
}

impl std::fmt::Debug for OnnxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxRuntime")
            .field("input_shape", &self.input_shape)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl OnnxRuntime {
    /// Loads the serialised model in `bytes`, expecting `[N, C, H, W]` inputs
    /// with `[C, H, W] == input_shape`.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::GraphRuntime)` if ONNX Runtime rejects the
    /// model.
    pub fn from_bytes(bytes: &[u8], input_shape: [usize; 3], origin: &Path) -> StrokeSegResult<Self> {
        let failed = |e: ort::Error| StrokeSegError::GraphRuntime {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        };

        let session = Session::builder()
            .map_err(failed)?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(failed)?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(failed)?
            .commit_from_memory(bytes)
            .map_err(failed)?;

        tracing::debug!(path = %origin.display(), "ONNX Runtime session created");
        Ok(Self {
            session: Mutex::new(session),
            input_shape,
            origin: origin.to_path_buf(),
        })
    }

    /// Serialises `graph` and loads it.
    ///
    /// # Errors
    ///
    /// See [`Graph::to_bytes`] and [`Self::from_bytes`].
    pub fn new(graph: &Graph, origin: &Path) -> StrokeSegResult<Self> {
        Self::from_bytes(&graph.to_bytes()?, graph.item_shape(), origin)
    }

    /// Logits of a `[N, C, H, W]` batch as `[N, 1, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for an input of the
    /// wrong shape and `Err(StrokeSegError::GraphRuntime)` if the session fails.
    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 4>> {
        let [n, c, h, w] = input.dims();
        if [c, h, w] != self.input_shape {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "input items are {:?}, expected {:?}",
                    [c, h, w],
                    self.input_shape
                ),
            });
        }

        let failed = |e: ort::Error| StrokeSegError::GraphRuntime {
            path: self.origin.clone(),
            reason: e.to_string(),
        };

        let device = input.device();
        let values: Vec<f32> = input.into_data().iter::<f32>().collect();
        let value = OrtTensor::from_array(([n, c, h, w], values)).map_err(failed)?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![INPUT_NAME => &value])
            .map_err(failed)?;
        let logits = outputs[OUTPUT_NAME].try_extract_array::<f32>().map_err(failed)?;

        let shape = logits.shape().to_vec();
        if shape != [n, 1, h, w] {
            return Err(StrokeSegError::GraphRuntime {
                path: self.origin.clone(),
                reason: format!("output shape {shape:?}, expected {:?}", [n, 1, h, w]),
            });
        }
        let data = TensorData::new(logits.iter().copied().collect::<Vec<f32>>(), shape);
        Ok(Tensor::from_data(data, &device))
    }

    pub const fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PreprocessConfig,
        export::trace::trace_model,
        test_utils::{tiny_config, TestBackend},
    };

    #[test]
    fn session_matches_model_forward_for_any_batch() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device).unwrap();
        let graph = trace_model(&model, &config, &PreprocessConfig::new(), "h");
        let runtime = OnnxRuntime::new(&graph, Path::new("mem")).unwrap();

        for batch in [1, 3] {
            let input = Tensor::<TestBackend, 4>::random(
                [batch, 3, 64, 64],
                burn::tensor::Distribution::Uniform(-2.0, 2.0),
                &device,
            );
            let expected = model.forward(input.clone());
            let actual = runtime.forward(input).unwrap();
            assert_eq!(actual.dims(), [batch, 1, 64, 64]);

            let diff = (actual.squeeze::<3>(1) - expected)
                .abs()
                .max()
                .into_scalar();
            assert!(diff < 1e-3, "batch {batch}: max diff {diff}");
        }
    }

    #[test]
    fn rejects_wrong_input_size() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device).unwrap();
        let graph = trace_model(&model, &config, &PreprocessConfig::new(), "h");
        let runtime = OnnxRuntime::new(&graph, Path::new("mem")).unwrap();

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert!(matches!(
            runtime.forward(input),
            Err(StrokeSegError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn rejects_garbage_model() {
        assert!(matches!(
            OnnxRuntime::from_bytes(b"not a model", [3, 64, 64], Path::new("mem")),
            Err(StrokeSegError::GraphRuntime { .. })
        ));
    }
}
