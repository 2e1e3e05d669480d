//! Portable static graph.
//!
//! In memory a graph is a topologically ordered list of nodes over numbered
//! values. Value `0` is the `[N, 3, H, W]` input; every node defines exactly
//! one new value. Weights live in one `f32` blob addressed by the initializer
//! table. On disk it is an ONNX model, see [`super::onnx`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::onnx;
use crate::{
    config::PreprocessConfig,
    error::{StrokeSegError, StrokeSegResult},
};

/// ONNX default-domain opset the graph targets.
pub const GRAPH_OPSET: u32 = 18;

/// Identifier of a value flowing between nodes.
pub type ValueId = usize;

/// The graph input.
pub const INPUT_VALUE: ValueId = 0;

/// Supported operators. All act on `[N, C, H, W]` tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Op {
    Conv2d {
        /// Initializer index of the `[C_out, C_in / groups, kH, kW]` weight.
        weight: usize,
        /// Initializer index of the `[C_out]` bias.
        bias: Option<usize>,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        groups: usize,
    },
    Relu,
    MaxPool2d {
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    },
    Add,
    /// Concatenation along the channel axis.
    Concat,
    UpsampleNearest {
        scale: usize,
    },
}

impl Op {
    /// Number of inputs, or `None` for variadic operators.
    pub const fn arity(&self) -> Option<usize> {
        match self {
            Self::Conv2d { .. } | Self::Relu | Self::MaxPool2d { .. } | Self::UpsampleNearest { .. } => {
                Some(1)
            }
            Self::Add => Some(2),
            Self::Concat => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "Conv2d",
            Self::Relu => "Relu",
            Self::MaxPool2d { .. } => "MaxPool2d",
            Self::Add => "Add",
            Self::Concat => "Concat",
            Self::UpsampleNearest { .. } => "UpsampleNearest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
}

/// A named slice of the weight blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub shape: Vec<usize>,
    /// Offset into the blob, in elements.
    pub offset: usize,
}

impl Initializer {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphHeader {
    pub opset: u32,
    pub input_channels: usize,
    pub input_height: usize,
    pub input_width: usize,
    /// Preprocessing the graph expects its input to have gone through.
    pub preprocess: PreprocessConfig,
    /// Content hash of the checkpoint the graph was traced from.
    pub source_hash: String,
    pub nodes: Vec<Node>,
    /// Value holding the `[N, 1, H, W]` logits.
    pub output: ValueId,
    pub initializers: Vec<Initializer>,
}

/// Header plus weights.
#[derive(Debug, Clone)]
pub struct Graph {
    pub header: GraphHeader,
    pub weights: Vec<f32>,
}

impl Graph {
    /// Weight values of initializer `index`.
    pub fn initializer(&self, index: usize) -> Option<(&Initializer, &[f32])> {
        let init = self.header.initializers.get(index)?;
        let values = self.weights.get(init.offset..init.offset + init.len())?;
        Some((init, values))
    }

    pub fn input_size(&self) -> [usize; 2] {
        [self.header.input_height, self.header.input_width]
    }

    /// `[C, H, W]` of one input item.
    pub fn item_shape(&self) -> [usize; 3] {
        let header = &self.header;
        [header.input_channels, header.input_height, header.input_width]
    }

    /// Checks opset, topological order, arities and initializer bounds.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactFormat)` labelled with `path`.
    pub fn validate(&self, path: &Path) -> StrokeSegResult<()> {
        let malformed = |reason: String| StrokeSegError::ArtifactFormat {
            path: path.to_path_buf(),
            reason,
        };
        let header = &self.header;

        if header.opset != GRAPH_OPSET {
            return Err(malformed(format!(
                "graph opset {} is not supported (expected {GRAPH_OPSET})",
                header.opset
            )));
        }

        for (i, init) in header.initializers.iter().enumerate() {
            if init.offset + init.len() > self.weights.len() {
                return Err(malformed(format!(
                    "initializer {i} ({}) exceeds the weight blob",
                    init.name
                )));
            }
        }

        let mut defined = vec![INPUT_VALUE];
        for (i, node) in header.nodes.iter().enumerate() {
            let arity_ok = match node.op.arity() {
                Some(n) => node.inputs.len() == n,
                None => node.inputs.len() >= 2,
            };
            if !arity_ok {
                return Err(malformed(format!(
                    "node {i} ({}) has {} inputs",
                    node.op.name(),
                    node.inputs.len()
                )));
            }
            if let Some(missing) = node.inputs.iter().find(|v| !defined.contains(v)) {
                return Err(malformed(format!(
                    "node {i} ({}) reads value {missing} before it is defined",
                    node.op.name()
                )));
            }
            if defined.contains(&node.output) {
                return Err(malformed(format!(
                    "node {i} redefines value {}",
                    node.output
                )));
            }
            if let Op::Conv2d { weight, bias, .. } = &node.op {
                let weight_ok = header
                    .initializers
                    .get(*weight)
                    .is_some_and(|w| w.shape.len() == 4);
                let bias_ok = bias.is_none_or(|b| {
                    header.initializers.get(b).is_some_and(|b| b.shape.len() == 1)
                });
                if !(weight_ok && bias_ok) {
                    return Err(malformed(format!("node {i} references a bad initializer")));
                }
            }
            defined.push(node.output);
        }

        if !defined.contains(&header.output) {
            return Err(malformed(format!(
                "output value {} is never defined",
                header.output
            )));
        }
        Ok(())
    }

    /// Serialises the graph as an ONNX `ModelProto`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the metadata cannot be encoded.
    pub fn to_bytes(&self) -> StrokeSegResult<Vec<u8>> {
        onnx::encode(self)
    }

    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactFormat)` for bytes that are not
    /// an ONNX model this build can represent.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> StrokeSegResult<Self> {
        let graph = onnx::decode(bytes, path)?;
        graph.validate(path)?;
        Ok(graph)
    }

    /// # Errors
    ///
    /// Returns I/O errors and `Err(StrokeSegError::ArtifactFormat)`.
    pub fn read(path: &Path) -> StrokeSegResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| StrokeSegError::io(path, e))?;
        Self::from_bytes(&bytes, path)
    }
}
