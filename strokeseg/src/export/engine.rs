//! Precision-compiled engines.
//!
//! An engine is a graph compiled for one precision, one maximum batch size
//! and the platform it was built on: Conv+ReLU pairs are fused, activation
//! memory is planned from value lifetimes, and weights are cast to the
//! target precision. Engines are not portable; loading one elsewhere fails
//! with [`StrokeSegError::IncompatibleEngine`].

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use burn_extra_ops::{pack_half, round_slice_to_half, unpack_half};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    container,
    graph::{Graph, Initializer, Op, ValueId, INPUT_VALUE},
    runtime::{Executor, StepSpec},
};
use crate::{
    config::{Precision, PreprocessConfig},
    error::{StrokeSegError, StrokeSegResult},
};

pub const ENGINE_MAGIC: &[u8; container::MAGIC_LEN] = b"SSENGIN1";
pub const ENGINE_FORMAT_VERSION: u32 = 1;

/// Builder options.
#[derive(Config, Debug)]
pub struct EngineBuildConfig {
    #[config(default = "Precision::Fp32")]
    pub precision: Precision,
    /// Budget for planned peak activation memory.
    #[config(default = "1 << 30")]
    pub workspace_bytes: u64,
    #[config(default = "1")]
    pub max_batch_size: usize,
}

/// Identifies the build environment an engine is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFingerprint {
    pub crate_version: String,
    pub arch: String,
    pub os: String,
}

impl PlatformFingerprint {
    pub fn current() -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            os: std::env::consts::OS.to_owned(),
        }
    }
}

impl fmt::Display for PlatformFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strokeseg {} on {}-{}", self.crate_version, self.arch, self.os)
    }
}

/// One compiled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStep {
    pub op: Op,
    /// A ReLU applied to the convolution output in the same step.
    pub fused_relu: bool,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
    /// `[C, H, W]` of the output for one batch item.
    pub shape: [usize; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHeader {
    pub format_version: u32,
    pub fingerprint: PlatformFingerprint,
    pub precision: Precision,
    pub max_batch_size: usize,
    pub workspace_bytes: u64,
    /// Planned peak activation memory at `max_batch_size`.
    pub required_workspace_bytes: u64,
    pub input_channels: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub preprocess: PreprocessConfig,
    /// Content hash of the originating checkpoint.
    pub source_hash: String,
    /// SHA-256 of the graph file the engine was compiled from.
    pub graph_hash: String,
    pub steps: Vec<EngineStep>,
    pub output: ValueId,
    pub initializers: Vec<Initializer>,
}

/// A compiled engine with its weights expanded to `f32`.
#[derive(Debug, Clone)]
pub struct Engine {
    pub header: EngineHeader,
    pub weights: Vec<f32>,
}

impl Engine {
    /// Compiles `graph` under `config`.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::EngineBuildFailure)` when the planned
    /// activation memory does not fit `config.workspace_bytes`, when the graph
    /// has inconsistent shapes, or when a weight is not representable at the
    /// requested precision. The builder never retries at another precision.
    pub fn build(graph: &Graph, config: &EngineBuildConfig) -> StrokeSegResult<Self> {
        let fail = |required: u64, reason: String| StrokeSegError::EngineBuildFailure {
            requested_workspace_bytes: config.workspace_bytes,
            required_workspace_bytes: required,
            precision: config.precision,
            reason,
        };

        if config.max_batch_size == 0 {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: "max_batch_size must be at least 1".into(),
            });
        }

        let shapes = infer_shapes(graph).map_err(|reason| fail(0, reason))?;
        let steps = fuse(graph, &shapes);

        let input_shape = [
            graph.header.input_channels,
            graph.header.input_height,
            graph.header.input_width,
        ];
        let peak_elements = peak_live_elements(&steps, graph.header.output, input_shape);
        let required = peak_elements as u64
            * config.max_batch_size as u64
            * config.precision.element_bytes();

        if config.workspace_bytes == 0 {
            return Err(fail(required, "workspace of 0 bytes".into()));
        }
        if required > config.workspace_bytes {
            return Err(fail(
                required,
                format!(
                    "peak activation memory at batch {} exceeds the workspace",
                    config.max_batch_size
                ),
            ));
        }

        let mut weights = graph.weights.clone();
        if config.precision == Precision::Fp16 {
            round_slice_to_half(&mut weights);
            if let Some(i) = weights.iter().position(|w| !w.is_finite()) {
                return Err(fail(
                    required,
                    format!("weight {i} ({}) overflows fp16", graph.weights[i]),
                ));
            }
        }

        let graph_bytes = graph.to_bytes()?;
        let header = &graph.header;
        let engine = Self {
            header: EngineHeader {
                format_version: ENGINE_FORMAT_VERSION,
                fingerprint: PlatformFingerprint::current(),
                precision: config.precision,
                max_batch_size: config.max_batch_size,
                workspace_bytes: config.workspace_bytes,
                required_workspace_bytes: required,
                input_channels: header.input_channels,
                input_height: header.input_height,
                input_width: header.input_width,
                preprocess: header.preprocess.clone(),
                source_hash: header.source_hash.clone(),
                graph_hash: format!("{:x}", Sha256::digest(&graph_bytes)),
                output: header.output,
                initializers: header.initializers.clone(),
                steps,
            },
            weights,
        };

        tracing::info!(
            precision = %config.precision,
            max_batch = config.max_batch_size,
            steps = engine.header.steps.len(),
            fused = engine.header.steps.iter().filter(|s| s.fused_relu).count(),
            required_workspace = required,
            "engine compiled"
        );
        Ok(engine)
    }

    /// # Errors
    ///
    /// Returns a serialization error if the header cannot be encoded.
    pub fn to_bytes(&self) -> StrokeSegResult<Vec<u8>> {
        let payload = match self.header.precision {
            Precision::Fp32 => container::f32_to_le_bytes(&self.weights),
            Precision::Fp16 => container::u16_to_le_bytes(&pack_half(&self.weights)),
        };
        container::encode(ENGINE_MAGIC, &self.header, &payload)
    }

    /// Reads an engine built on this platform.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::IncompatibleEngine)` for an engine built
    /// under another fingerprint and `Err(StrokeSegError::ArtifactFormat)` for
    /// malformed files.
    pub fn read(path: &Path) -> StrokeSegResult<Self> {
        Self::read_with_fingerprint(path, &PlatformFingerprint::current())
    }

    /// Reads an engine, requiring it to have been built under `expected`.
    ///
    /// # Errors
    ///
    /// See [`Engine::read`].
    pub fn read_with_fingerprint(
        path: &Path,
        expected: &PlatformFingerprint,
    ) -> StrokeSegResult<Self> {
        let (header, payload): (EngineHeader, _) = container::read(ENGINE_MAGIC, path)?;
        let malformed = |reason: String| StrokeSegError::ArtifactFormat {
            path: path.to_path_buf(),
            reason,
        };

        if header.format_version != ENGINE_FORMAT_VERSION {
            return Err(malformed(format!(
                "engine format {} is not supported (expected {ENGINE_FORMAT_VERSION})",
                header.format_version
            )));
        }
        if &header.fingerprint != expected {
            return Err(StrokeSegError::IncompatibleEngine {
                path: path.to_path_buf(),
                built_for: header.fingerprint.to_string(),
                running_on: expected.to_string(),
            });
        }

        let weights = match header.precision {
            Precision::Fp32 if payload.len() % 4 == 0 => container::f32_from_le_bytes(&payload),
            Precision::Fp16 if payload.len() % 2 == 0 => {
                unpack_half(&container::u16_from_le_bytes(&payload))
            }
            precision => {
                return Err(malformed(format!(
                    "{} byte weight blob is not aligned to {precision}",
                    payload.len()
                )))
            }
        };

        let expected_len = header
            .initializers
            .iter()
            .map(|i| i.offset + i.len())
            .max()
            .unwrap_or(0);
        if weights.len() < expected_len {
            return Err(malformed(format!(
                "weight blob holds {} values, initializers need {expected_len}",
                weights.len()
            )));
        }

        Ok(Self { header, weights })
    }

    /// # Errors
    ///
    /// Returns serialization or I/O errors.
    pub fn write(&self, path: &Path) -> StrokeSegResult<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(|e| StrokeSegError::io(path, e))
    }

    pub fn input_size(&self) -> [usize; 2] {
        [self.header.input_height, self.header.input_width]
    }
}

/// `[C, H, W]` of every value, or a description of the first inconsistency.
fn infer_shapes(graph: &Graph) -> Result<HashMap<ValueId, [usize; 3]>, String> {
    let header = &graph.header;
    let mut shapes = HashMap::new();
    shapes.insert(
        INPUT_VALUE,
        [header.input_channels, header.input_height, header.input_width],
    );

    for (i, node) in header.nodes.iter().enumerate() {
        let input = |k: usize| -> Result<[usize; 3], String> {
            node.inputs
                .get(k)
                .and_then(|v| shapes.get(v))
                .copied()
                .ok_or_else(|| format!("node {i} ({}) lacks input {k}", node.op.name()))
        };

        let shape = match &node.op {
            Op::Conv2d {
                weight,
                stride,
                padding,
                dilation,
                groups,
                ..
            } => {
                let [c, h, w] = input(0)?;
                let kernel = header
                    .initializers
                    .get(*weight)
                    .map(|init| init.shape.clone())
                    .ok_or_else(|| format!("node {i} references missing weight {weight}"))?;
                let [out, per_group, kh, kw] = kernel[..] else {
                    return Err(format!("node {i} weight is not rank 4"));
                };
                if per_group * groups != c {
                    return Err(format!(
                        "node {i} expects {} input channels, got {c}",
                        per_group * groups
                    ));
                }
                [
                    out,
                    window_output(h, kh, stride[0], padding[0], dilation[0])
                        .ok_or_else(|| format!("node {i} kernel exceeds its input"))?,
                    window_output(w, kw, stride[1], padding[1], dilation[1])
                        .ok_or_else(|| format!("node {i} kernel exceeds its input"))?,
                ]
            }
            Op::MaxPool2d {
                kernel,
                stride,
                padding,
            } => {
                let [c, h, w] = input(0)?;
                [
                    c,
                    window_output(h, kernel[0], stride[0], padding[0], 1)
                        .ok_or_else(|| format!("node {i} pool exceeds its input"))?,
                    window_output(w, kernel[1], stride[1], padding[1], 1)
                        .ok_or_else(|| format!("node {i} pool exceeds its input"))?,
                ]
            }
            Op::Relu => input(0)?,
            Op::Add => {
                let (a, b) = (input(0)?, input(1)?);
                if a != b {
                    return Err(format!("node {i} adds {a:?} and {b:?}"));
                }
                a
            }
            Op::Concat => {
                let first = input(0)?;
                let mut channels = 0;
                for k in 0..node.inputs.len() {
                    let [c, h, w] = input(k)?;
                    if [h, w] != first[1..] {
                        return Err(format!("node {i} concatenates mismatched sizes"));
                    }
                    channels += c;
                }
                [channels, first[1], first[2]]
            }
            Op::UpsampleNearest { scale } => {
                let [c, h, w] = input(0)?;
                [c, h * scale, w * scale]
            }
        };
        shapes.insert(node.output, shape);
    }
    Ok(shapes)
}

fn window_output(size: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> Option<usize> {
    let span = dilation * kernel.saturating_sub(1) + 1;
    (size + 2 * padding)
        .checked_sub(span)
        .filter(|_| stride > 0)
        .map(|n| n / stride + 1)
}

/// Turns graph nodes into steps, folding a ReLU into the convolution it
/// follows when the convolution output has no other reader.
fn fuse(graph: &Graph, shapes: &HashMap<ValueId, [usize; 3]>) -> Vec<EngineStep> {
    let header = &graph.header;
    let mut readers: HashMap<ValueId, Vec<usize>> = HashMap::new();
    for (i, node) in header.nodes.iter().enumerate() {
        for &v in &node.inputs {
            readers.entry(v).or_default().push(i);
        }
    }

    let mut absorbed = vec![false; header.nodes.len()];
    let mut steps = Vec::with_capacity(header.nodes.len());

    for (i, node) in header.nodes.iter().enumerate() {
        if absorbed[i] {
            continue;
        }

        let mut output = node.output;
        let mut fused_relu = false;
        if matches!(node.op, Op::Conv2d { .. }) && node.output != header.output {
            if let Some(&[j]) = readers.get(&node.output).map(Vec::as_slice) {
                if header.nodes[j].op == Op::Relu {
                    absorbed[j] = true;
                    output = header.nodes[j].output;
                    fused_relu = true;
                }
            }
        }

        steps.push(EngineStep {
            op: node.op.clone(),
            fused_relu,
            inputs: node.inputs.clone(),
            output,
            shape: shapes.get(&output).copied().unwrap_or_default(),
        });
    }
    steps
}

/// Largest number of per-item activation elements alive at once.
fn peak_live_elements(steps: &[EngineStep], output: ValueId, input_shape: [usize; 3]) -> usize {
    let mut last_use: HashMap<ValueId, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        for &v in &step.inputs {
            last_use.insert(v, i);
        }
    }

    let numel = |s: [usize; 3]| s.iter().product::<usize>();
    let mut live: HashMap<ValueId, usize> = HashMap::from([(INPUT_VALUE, numel(input_shape))]);
    let mut peak = numel(input_shape);

    for (i, step) in steps.iter().enumerate() {
        live.insert(step.output, numel(step.shape));
        peak = peak.max(live.values().sum());
        live.retain(|v, _| *v == output || last_use.get(v).is_some_and(|&last| last > i));
    }
    peak
}

/// Runs an [`Engine`] on a Burn backend, emulating its precision.
#[derive(Debug)]
pub struct EngineRuntime<B: Backend> {
    executor: Executor<B>,
    max_batch_size: usize,
    precision: Precision,
}

impl<B: Backend> EngineRuntime<B> {
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactFormat)` for steps referencing
    /// missing parameters.
    pub fn new(engine: &Engine, origin: PathBuf, device: &B::Device) -> StrokeSegResult<Self> {
        let header = &engine.header;
        let specs = header.steps.iter().map(|step| StepSpec {
            op: &step.op,
            fused_relu: step.fused_relu,
            inputs: &step.inputs,
            output: step.output,
        });

        Ok(Self {
            executor: Executor::new(
                specs,
                &header.initializers,
                &engine.weights,
                header.output,
                [header.input_channels, header.input_height, header.input_width],
                header.precision == Precision::Fp16,
                origin,
                device,
            )?,
            max_batch_size: header.max_batch_size,
            precision: header.precision,
        })
    }

    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub const fn precision(&self) -> Precision {
        self.precision
    }

    pub const fn input_shape(&self) -> [usize; 3] {
        self.executor.input_shape()
    }

    /// Logits of a `[N, C, H, W]` batch as `[N, 1, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::UnsupportedBackendOperation)` when `N`
    /// exceeds the engine's batch size.
    pub fn forward(&self, input: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 4>> {
        let batch = input.dims()[0];
        if batch > self.max_batch_size {
            return Err(StrokeSegError::UnsupportedBackendOperation {
                backend: format!("engine-{}", self.precision),
                operation: "forward".into(),
                requested_batch: batch,
                max_batch: self.max_batch_size,
            });
        }
        self.executor.run(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        export::trace::trace_model,
        test_utils::{tiny_config, TestBackend},
    };

    fn tiny_graph() -> Graph {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device).unwrap();
        trace_model(&model, &config, &PreprocessConfig::new(), "h")
    }

    #[test]
    fn fuses_every_conv_followed_by_relu() {
        let graph = tiny_graph();
        let engine = Engine::build(&graph, &EngineBuildConfig::new()).unwrap();
        let steps = &engine.header.steps;

        // Stem, first conv of each block, and both convs of every decoder block.
        assert_eq!(steps.iter().filter(|s| s.fused_relu).count(), 1 + 8 + 10);
        assert!(!steps.iter().any(|s| s.op == Op::Relu && s.inputs.len() == 1 && {
            let producer = steps.iter().find(|p| p.output == s.inputs[0]);
            producer.is_some_and(|p| matches!(p.op, Op::Conv2d { .. }))
        }));
        assert_eq!(steps.last().unwrap().shape, [1, 64, 64]);
        assert_eq!(steps.last().unwrap().output, graph.header.output);
    }

    #[test]
    fn workspace_scales_with_batch_and_precision() {
        let graph = tiny_graph();
        let fp32 = Engine::build(&graph, &EngineBuildConfig::new()).unwrap();
        let fp16 = Engine::build(
            &graph,
            &EngineBuildConfig::new().with_precision(Precision::Fp16),
        )
        .unwrap();
        let batch4 = Engine::build(&graph, &EngineBuildConfig::new().with_max_batch_size(4)).unwrap();

        let base = fp32.header.required_workspace_bytes;
        assert!(base > 0);
        assert_eq!(fp16.header.required_workspace_bytes * 2, base);
        assert_eq!(batch4.header.required_workspace_bytes, base * 4);
    }

    #[test]
    fn zero_or_small_workspace_fails() {
        let graph = tiny_graph();
        for workspace in [0, 1024] {
            let result = Engine::build(
                &graph,
                &EngineBuildConfig::new()
                    .with_precision(Precision::Fp16)
                    .with_workspace_bytes(workspace),
            );
            match result {
                Err(StrokeSegError::EngineBuildFailure {
                    requested_workspace_bytes,
                    required_workspace_bytes,
                    precision,
                    ..
                }) => {
                    assert_eq!(requested_workspace_bytes, workspace);
                    assert!(required_workspace_bytes > 1024);
                    assert_eq!(precision, Precision::Fp16);
                }
                other => panic!("expected EngineBuildFailure, got {other:?}"),
            }
        }
    }

    #[test]
    fn foreign_fingerprint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sse");
        let engine = Engine::build(&tiny_graph(), &EngineBuildConfig::new()).unwrap();
        engine.write(&path).unwrap();

        assert!(Engine::read(&path).is_ok());

        let other = PlatformFingerprint {
            crate_version: "0.0.0-other".into(),
            ..PlatformFingerprint::current()
        };
        assert!(matches!(
            Engine::read_with_fingerprint(&path, &other),
            Err(StrokeSegError::IncompatibleEngine { .. })
        ));
    }

    #[test]
    fn fp16_weights_survive_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sse");
        let engine = Engine::build(
            &tiny_graph(),
            &EngineBuildConfig::new().with_precision(Precision::Fp16),
        )
        .unwrap();
        engine.write(&path).unwrap();

        let loaded = Engine::read(&path).unwrap();
        assert_eq!(loaded.weights, engine.weights);
        assert_eq!(loaded.header.steps, engine.header.steps);
    }

    #[test]
    fn engine_runtime_enforces_batch_limit() {
        let device = Default::default();
        let engine = Engine::build(&tiny_graph(), &EngineBuildConfig::new()).unwrap();
        let runtime = EngineRuntime::<TestBackend>::new(&engine, "mem".into(), &device).unwrap();

        let one = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(runtime.forward(one).unwrap().dims(), [1, 1, 64, 64]);

        let two = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert!(matches!(
            runtime.forward(two),
            Err(StrokeSegError::UnsupportedBackendOperation {
                requested_batch: 2,
                max_batch: 1,
                ..
            })
        ));
    }
}
