//! ONNX serialisation of a [`Graph`].
//!
//! Graph files are plain ONNX `ModelProto`s in the default operator domain
//! at [`ONNX_OPSET`], with a symbolic batch axis, so any ONNX consumer can
//! load them. The checkpoint hash and the expected preprocessing travel in
//! `metadata_props`.
//!
//! Only the message subset needed here is declared. Field numbers follow
//! `onnx.proto`.

use std::{collections::HashMap, path::Path};

use prost::Message;

use super::graph::{Graph, GraphHeader, Initializer, Node, Op, ValueId, GRAPH_OPSET, INPUT_VALUE};
use crate::{
    config::PreprocessConfig,
    error::{StrokeSegError, StrokeSegResult},
};

/// Default-domain operator set the graph is written against.
pub const ONNX_OPSET: i64 = GRAPH_OPSET as i64;
/// Lowest IR version that carries opset 18.
pub const ONNX_IR_VERSION: i64 = 8;

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "logits";
pub const BATCH_DIM: &str = "batch";

pub const SOURCE_HASH_KEY: &str = "strokeseg.source_hash";
pub const PREPROCESS_KEY: &str = "strokeseg.preprocess";

pub mod proto {
    //! Hand-declared subset of `onnx.proto`.

    /// `TensorProto.DataType.FLOAT`
    pub const FLOAT: i32 = 1;

    /// `AttributeProto.AttributeType`
    pub const ATTR_INT: i32 = 2;
    pub const ATTR_STRING: i32 = 3;
    pub const ATTR_INTS: i32 = 7;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ModelProto {
        #[prost(int64, tag = "1")]
        pub ir_version: i64,
        #[prost(string, tag = "2")]
        pub producer_name: String,
        #[prost(string, tag = "3")]
        pub producer_version: String,
        #[prost(string, tag = "4")]
        pub domain: String,
        #[prost(int64, tag = "5")]
        pub model_version: i64,
        #[prost(string, tag = "6")]
        pub doc_string: String,
        #[prost(message, optional, tag = "7")]
        pub graph: Option<GraphProto>,
        #[prost(message, repeated, tag = "8")]
        pub opset_import: Vec<OperatorSetIdProto>,
        #[prost(message, repeated, tag = "14")]
        pub metadata_props: Vec<StringStringEntryProto>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct OperatorSetIdProto {
        #[prost(string, tag = "1")]
        pub domain: String,
        #[prost(int64, tag = "2")]
        pub version: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StringStringEntryProto {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GraphProto {
        #[prost(message, repeated, tag = "1")]
        pub node: Vec<NodeProto>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(message, repeated, tag = "5")]
        pub initializer: Vec<TensorProto>,
        #[prost(string, tag = "10")]
        pub doc_string: String,
        #[prost(message, repeated, tag = "11")]
        pub input: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "12")]
        pub output: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "13")]
        pub value_info: Vec<ValueInfoProto>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct NodeProto {
        #[prost(string, repeated, tag = "1")]
        pub input: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub output: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, tag = "4")]
        pub op_type: String,
        #[prost(message, repeated, tag = "5")]
        pub attribute: Vec<AttributeProto>,
        #[prost(string, tag = "6")]
        pub doc_string: String,
        #[prost(string, tag = "7")]
        pub domain: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AttributeProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(float, tag = "2")]
        pub f: f32,
        #[prost(int64, tag = "3")]
        pub i: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub s: Vec<u8>,
        #[prost(float, repeated, tag = "7")]
        pub floats: Vec<f32>,
        #[prost(int64, repeated, tag = "8")]
        pub ints: Vec<i64>,
        #[prost(int32, tag = "20")]
        pub r#type: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TensorProto {
        #[prost(int64, repeated, tag = "1")]
        pub dims: Vec<i64>,
        #[prost(int32, tag = "2")]
        pub data_type: i32,
        #[prost(float, repeated, tag = "4")]
        pub float_data: Vec<f32>,
        #[prost(string, tag = "8")]
        pub name: String,
        #[prost(bytes = "vec", tag = "9")]
        pub raw_data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ValueInfoProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub r#type: Option<TypeProto>,
    }

    /// `TypeProto` restricted to its `tensor_type` case.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TypeProto {
        #[prost(message, optional, tag = "1")]
        pub tensor_type: Option<TensorTypeProto>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TensorTypeProto {
        #[prost(int32, tag = "1")]
        pub elem_type: i32,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<TensorShapeProto>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TensorShapeProto {
        #[prost(message, repeated, tag = "1")]
        pub dim: Vec<Dimension>,
    }

    /// One of `dim_value` or `dim_param` is set.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dimension {
        #[prost(int64, optional, tag = "1")]
        pub dim_value: Option<i64>,
        #[prost(string, optional, tag = "2")]
        pub dim_param: Option<String>,
    }
}

use proto::{
    AttributeProto, Dimension, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TensorTypeProto, TypeProto,
    ValueInfoProto,
};

fn value_name(id: ValueId, output: ValueId) -> String {
    if id == INPUT_VALUE {
        INPUT_NAME.to_owned()
    } else if id == output {
        OUTPUT_NAME.to_owned()
    } else {
        format!("t{id}")
    }
}

fn ints_attr(name: &str, values: &[usize]) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        ints: values.iter().map(|&v| v as i64).collect(),
        r#type: proto::ATTR_INTS,
        ..AttributeProto::default()
    }
}

fn int_attr(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        i: value,
        r#type: proto::ATTR_INT,
        ..AttributeProto::default()
    }
}

fn string_attr(name: &str, value: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        s: value.as_bytes().to_vec(),
        r#type: proto::ATTR_STRING,
        ..AttributeProto::default()
    }
}

fn float_tensor(name: String, dims: &[usize], values: &[f32]) -> TensorProto {
    TensorProto {
        dims: dims.iter().map(|&d| d as i64).collect(),
        data_type: proto::FLOAT,
        name,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

fn tensor_info(name: &str, channels: usize, height: usize, width: usize) -> ValueInfoProto {
    let fixed = |v: usize| Dimension {
        dim_value: Some(v as i64),
        dim_param: None,
    };
    ValueInfoProto {
        name: name.to_owned(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type: proto::FLOAT,
                shape: Some(TensorShapeProto {
                    dim: vec![
                        Dimension {
                            dim_value: None,
                            dim_param: Some(BATCH_DIM.to_owned()),
                        },
                        fixed(channels),
                        fixed(height),
                        fixed(width),
                    ],
                }),
            }),
        }),
    }
}

/// Builds the `ModelProto` for `graph`.
///
/// # Errors
///
/// Returns a serialization error if the preprocessing cannot be encoded.
pub fn to_model_proto(graph: &Graph) -> StrokeSegResult<ModelProto> {
    let header = &graph.header;
    let name = |id| value_name(id, header.output);

    let mut initializer: Vec<TensorProto> = header
        .initializers
        .iter()
        .enumerate()
        .filter_map(|(i, init)| {
            graph
                .initializer(i)
                .map(|(_, values)| float_tensor(init.name.clone(), &init.shape, values))
        })
        .collect();

    let mut nodes = Vec::with_capacity(header.nodes.len());
    for (index, node) in header.nodes.iter().enumerate() {
        let mut input: Vec<String> = node.inputs.iter().map(|&v| name(v)).collect();
        let (op_type, attribute) = match &node.op {
            Op::Conv2d {
                weight,
                bias,
                stride,
                padding,
                dilation,
                groups,
            } => {
                let kernel = header
                    .initializers
                    .get(*weight)
                    .map(|w| w.shape.get(2..4).unwrap_or_default().to_vec())
                    .unwrap_or_default();
                input.extend(header.initializers.get(*weight).map(|w| w.name.clone()));
                input.extend(bias.and_then(|b| header.initializers.get(b)).map(|b| b.name.clone()));
                (
                    "Conv",
                    vec![
                        ints_attr("kernel_shape", &kernel),
                        ints_attr("strides", stride),
                        ints_attr("pads", &[padding[0], padding[1], padding[0], padding[1]]),
                        ints_attr("dilations", dilation),
                        int_attr("group", *groups as i64),
                    ],
                )
            }
            Op::Relu => ("Relu", Vec::new()),
            Op::MaxPool2d {
                kernel,
                stride,
                padding,
            } => (
                "MaxPool",
                vec![
                    ints_attr("kernel_shape", kernel),
                    ints_attr("strides", stride),
                    ints_attr("pads", &[padding[0], padding[1], padding[0], padding[1]]),
                ],
            ),
            Op::Add => ("Add", Vec::new()),
            Op::Concat => ("Concat", vec![int_attr("axis", 1)]),
            Op::UpsampleNearest { scale } => {
                let scales = format!("resize_{index}.scales");
                let s = *scale as f32;
                initializer.push(float_tensor(scales.clone(), &[4], &[1.0, 1.0, s, s]));
                input.push(String::new());
                input.push(scales);
                (
                    "Resize",
                    vec![
                        string_attr("mode", "nearest"),
                        string_attr("coordinate_transformation_mode", "asymmetric"),
                        string_attr("nearest_mode", "floor"),
                    ],
                )
            }
        };

        nodes.push(NodeProto {
            input,
            output: vec![name(node.output)],
            name: format!("{op_type}_{index}"),
            op_type: op_type.to_owned(),
            attribute,
            ..NodeProto::default()
        });
    }

    let preprocess = serde_json::to_string(&header.preprocess)
        .map_err(|e| StrokeSegError::serialization("graph preprocessing metadata", e))?;

    Ok(ModelProto {
        ir_version: ONNX_IR_VERSION,
        producer_name: "strokeseg".to_owned(),
        producer_version: env!("CARGO_PKG_VERSION").to_owned(),
        graph: Some(GraphProto {
            node: nodes,
            name: "strokeseg_unet".to_owned(),
            initializer,
            input: vec![tensor_info(
                INPUT_NAME,
                header.input_channels,
                header.input_height,
                header.input_width,
            )],
            output: vec![tensor_info(
                OUTPUT_NAME,
                1,
                header.input_height,
                header.input_width,
            )],
            ..GraphProto::default()
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: i64::from(header.opset),
        }],
        metadata_props: vec![
            StringStringEntryProto {
                key: SOURCE_HASH_KEY.to_owned(),
                value: header.source_hash.clone(),
            },
            StringStringEntryProto {
                key: PREPROCESS_KEY.to_owned(),
                value: preprocess,
            },
        ],
        ..ModelProto::default()
    })
}

/// Encodes `graph` as ONNX protobuf bytes.
///
/// # Errors
///
/// See [`to_model_proto`].
pub fn encode(graph: &Graph) -> StrokeSegResult<Vec<u8>> {
    Ok(to_model_proto(graph)?.encode_to_vec())
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_pair(node: &NodeProto, name: &str, default: usize) -> Option<[usize; 2]> {
    match attr(node, name) {
        None => Some([default; 2]),
        Some(a) => match a.ints.as_slice() {
            [h, w] => Some([usize::try_from(*h).ok()?, usize::try_from(*w).ok()?]),
            _ => None,
        },
    }
}

/// Symmetric `[top, left, bottom, right]` pads as `[h, w]`.
fn attr_pads(node: &NodeProto) -> Option<[usize; 2]> {
    match attr(node, "pads") {
        None => Some([0, 0]),
        Some(a) => match a.ints.as_slice() {
            [t, l, b, r] if t == b && l == r => {
                Some([usize::try_from(*t).ok()?, usize::try_from(*l).ok()?])
            }
            _ => None,
        },
    }
}

fn attr_str<'a>(node: &'a NodeProto, name: &str) -> Option<&'a [u8]> {
    attr(node, name).map(|a| a.s.as_slice())
}

fn tensor_values(tensor: &TensorProto) -> Option<Vec<f32>> {
    if tensor.data_type != proto::FLOAT {
        return None;
    }
    if tensor.raw_data.is_empty() {
        return Some(tensor.float_data.clone());
    }
    if tensor.raw_data.len() % 4 != 0 {
        return None;
    }
    Some(
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn spatial_dims(info: &ValueInfoProto) -> Option<[usize; 3]> {
    let dims = &info.r#type.as_ref()?.tensor_type.as_ref()?.shape.as_ref()?.dim;
    let fixed = |d: &Dimension| d.dim_value.and_then(|v| usize::try_from(v).ok());
    match dims.as_slice() {
        [_, c, h, w] => Some([fixed(c)?, fixed(h)?, fixed(w)?]),
        _ => None,
    }
}

/// Rebuilds a [`Graph`] from a `ModelProto` written by [`encode`].
///
/// # Errors
///
/// Returns `Err(StrokeSegError::ArtifactFormat)` labelled with `path` for
/// bytes that are not ONNX, operators outside the supported subset, or
/// missing metadata.
pub fn decode(bytes: &[u8], path: &Path) -> StrokeSegResult<Graph> {
    let malformed = |reason: String| StrokeSegError::ArtifactFormat {
        path: path.to_path_buf(),
        reason,
    };

    let model = ModelProto::decode(bytes).map_err(|e| malformed(format!("not an ONNX model: {e}")))?;
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .ok_or_else(|| malformed("model imports no default-domain opset".to_owned()))?
        .version;
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| malformed("model has no graph".to_owned()))?;

    let metadata = |key: &str| {
        model
            .metadata_props
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
            .ok_or_else(|| malformed(format!("metadata '{key}' is missing")))
    };
    let source_hash = metadata(SOURCE_HASH_KEY)?.to_owned();
    let preprocess: PreprocessConfig = serde_json::from_str(metadata(PREPROCESS_KEY)?)
        .map_err(|e| malformed(format!("invalid preprocessing metadata: {e}")))?;

    let input = graph
        .input
        .iter()
        .find(|i| i.name == INPUT_NAME)
        .ok_or_else(|| malformed(format!("graph input '{INPUT_NAME}' is missing")))?;
    let [input_channels, input_height, input_width] = spatial_dims(input)
        .ok_or_else(|| malformed("graph input must be [batch, C, H, W] with fixed C, H, W".to_owned()))?;

    let tensors: HashMap<&str, &TensorProto> = graph
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    let mut ids: HashMap<&str, ValueId> = HashMap::from([(INPUT_NAME, INPUT_VALUE)]);
    let mut initializers = Vec::new();
    let mut init_index: HashMap<String, usize> = HashMap::new();
    let mut weights = Vec::new();
    let mut nodes = Vec::with_capacity(graph.node.len());

    for (index, node) in graph.node.iter().enumerate() {
        let bad = |what: &str| malformed(format!("node {index} ({}): {what}", node.op_type));

        let mut load_init = |name: &str| -> StrokeSegResult<usize> {
            if let Some(&i) = init_index.get(name) {
                return Ok(i);
            }
            let tensor = tensors
                .get(name)
                .ok_or_else(|| bad(&format!("initializer '{name}' is missing")))?;
            let values = tensor_values(tensor).ok_or_else(|| bad("initializer is not f32"))?;
            let shape: Vec<usize> = tensor
                .dims
                .iter()
                .map(|&d| usize::try_from(d))
                .collect::<Result<_, _>>()
                .map_err(|_| bad("negative initializer dimension"))?;
            if shape.iter().product::<usize>() != values.len() {
                return Err(bad("initializer size does not match its shape"));
            }
            initializers.push(Initializer {
                name: name.to_owned(),
                shape,
                offset: weights.len(),
            });
            weights.extend(values);
            init_index.insert(name.to_owned(), initializers.len() - 1);
            Ok(initializers.len() - 1)
        };

        let (op, data_inputs) = match node.op_type.as_str() {
            "Conv" => {
                let [x, w, rest @ ..] = node.input.as_slice() else {
                    return Err(bad("expects input and weight"));
                };
                let weight = load_init(w.as_str())?;
                let bias = match rest.first().filter(|b| !b.is_empty()) {
                    Some(b) => Some(load_init(b.as_str())?),
                    None => None,
                };
                let groups = attr(node, "group").map_or(Ok(1), |a| usize::try_from(a.i));
                (
                    Op::Conv2d {
                        weight,
                        bias,
                        stride: attr_pair(node, "strides", 1).ok_or_else(|| bad("bad strides"))?,
                        padding: attr_pads(node).ok_or_else(|| bad("asymmetric or bad pads"))?,
                        dilation: attr_pair(node, "dilations", 1).ok_or_else(|| bad("bad dilations"))?,
                        groups: groups.map_err(|_| bad("bad group"))?,
                    },
                    vec![x.as_str()],
                )
            }
            "Relu" => (Op::Relu, node.input.iter().map(String::as_str).collect()),
            "MaxPool" => (
                Op::MaxPool2d {
                    kernel: attr_pair(node, "kernel_shape", 1)
                        .filter(|_| attr(node, "kernel_shape").is_some())
                        .ok_or_else(|| bad("bad kernel_shape"))?,
                    stride: attr_pair(node, "strides", 1).ok_or_else(|| bad("bad strides"))?,
                    padding: attr_pads(node).ok_or_else(|| bad("asymmetric or bad pads"))?,
                },
                node.input.iter().map(String::as_str).collect(),
            ),
            "Add" => (Op::Add, node.input.iter().map(String::as_str).collect()),
            "Concat" => {
                if attr(node, "axis").map(|a| a.i) != Some(1) {
                    return Err(bad("only channel concatenation is supported"));
                }
                (Op::Concat, node.input.iter().map(String::as_str).collect())
            }
            "Resize" => {
                let nearest = attr_str(node, "mode") == Some(b"nearest".as_slice())
                    && attr_str(node, "coordinate_transformation_mode")
                        == Some(b"asymmetric".as_slice())
                    && attr_str(node, "nearest_mode") == Some(b"floor".as_slice());
                if !nearest {
                    return Err(bad("only asymmetric floor nearest resizing is supported"));
                }
                let [x, _, scales, ..] = node.input.as_slice() else {
                    return Err(bad("expects input, roi and scales"));
                };
                let values = tensors
                    .get(scales.as_str())
                    .and_then(|t| tensor_values(t))
                    .ok_or_else(|| bad("scales must be an f32 initializer"))?;
                let scale = match values.as_slice() {
                    [n, c, h, w] if *n == 1.0 && *c == 1.0 && h == w && h.fract() == 0.0 && *h >= 1.0 => {
                        *h as usize
                    }
                    _ => return Err(bad("scales must be [1, 1, s, s] with integer s")),
                };
                (Op::UpsampleNearest { scale }, vec![x.as_str()])
            }
            other => return Err(bad(&format!("operator {other} is not supported"))),
        };

        let inputs = data_inputs
            .iter()
            .map(|name| {
                ids.get(name)
                    .copied()
                    .ok_or_else(|| bad(&format!("reads '{name}' before it is defined")))
            })
            .collect::<StrokeSegResult<Vec<_>>>()?;

        let [output_name] = node.output.as_slice() else {
            return Err(bad("expects exactly one output"));
        };
        let output = ids.len();
        if ids.insert(output_name.as_str(), output).is_some() {
            return Err(bad(&format!("redefines '{output_name}'")));
        }
        nodes.push(Node { op, inputs, output });
    }

    let output = ids
        .get(OUTPUT_NAME)
        .copied()
        .filter(|_| graph.output.iter().any(|o| o.name == OUTPUT_NAME))
        .ok_or_else(|| malformed(format!("graph output '{OUTPUT_NAME}' is missing")))?;

    let opset = u32::try_from(opset).map_err(|_| malformed(format!("bad opset {opset}")))?;
    Ok(Graph {
        header: GraphHeader {
            opset,
            input_channels,
            input_height,
            input_width,
            preprocess,
            source_hash,
            nodes,
            output,
            initializers,
        },
        weights,
    })
}
