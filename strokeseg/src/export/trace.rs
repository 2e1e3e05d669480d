//! Tracing a [`StrokeUNet`] into a [`Graph`].
//!
//! Batch norms are folded into the preceding convolution using their running
//! statistics, so the graph reproduces the model's inference behaviour with
//! convolutions only.

use burn::{
    nn::{conv::Conv2d, BatchNorm, PaddingConfig2d},
    prelude::*,
};
use resnet::{BasicBlock, LayerBlock, ResNetEncoder};

use super::graph::{Graph, GraphHeader, Initializer, Node, Op, ValueId, GRAPH_OPSET, INPUT_VALUE};
use crate::{
    config::{ModelConfig, PreprocessConfig},
    models::{decoder::DECODER_SCALE, ConvBnRelu, DecoderBlock, StrokeUNet, UnetDecoder},
};

fn host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

fn explicit_padding(padding: &PaddingConfig2d, kernel: [usize; 2]) -> [usize; 2] {
    match padding {
        PaddingConfig2d::Explicit(h, w) => [*h, *w],
        PaddingConfig2d::Valid => [0, 0],
        PaddingConfig2d::Same => [(kernel[0] - 1) / 2, (kernel[1] - 1) / 2],
    }
}

/// Accumulates nodes and weights while walking a model.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    initializers: Vec<Initializer>,
    weights: Vec<f32>,
    values: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            values: INPUT_VALUE + 1,
            ..Self::default()
        }
    }

    pub fn push(&mut self, op: Op, inputs: Vec<ValueId>) -> ValueId {
        let output = self.values;
        self.values += 1;
        self.nodes.push(Node { op, inputs, output });
        output
    }

    pub fn initializer(&mut self, name: String, shape: Vec<usize>, values: Vec<f32>) -> usize {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        self.initializers.push(Initializer {
            name,
            shape,
            offset: self.weights.len(),
        });
        self.weights.extend(values);
        self.initializers.len() - 1
    }

    /// Emits a convolution, folding `bn` into its weight and bias.
    pub fn conv<B: Backend>(
        &mut self,
        name: &str,
        conv: &Conv2d<B>,
        bn: Option<&BatchNorm<B, 2>>,
        input: ValueId,
    ) -> ValueId {
        let shape = conv.weight.dims();
        let [out_channels, _, kh, kw] = shape;
        let mut weight = host(conv.weight.val());
        let mut bias = conv
            .bias
            .as_ref()
            .map(|b| host(b.val()))
            .unwrap_or_else(|| vec![0.0; out_channels]);

        if let Some(bn) = bn {
            let gamma = host(bn.gamma.val());
            let beta = host(bn.beta.val());
            let mean = host(bn.running_mean.value());
            let var = host(bn.running_var.value());
            let per_filter = weight.len() / out_channels;

            for o in 0..out_channels {
                let scale = (f64::from(gamma[o]) / (f64::from(var[o]) + bn.epsilon).sqrt()) as f32;
                for w in &mut weight[o * per_filter..(o + 1) * per_filter] {
                    *w *= scale;
                }
                bias[o] = (bias[o] - mean[o]).mul_add(scale, beta[o]);
            }
        }

        let weight = self.initializer(format!("{name}.weight"), shape.to_vec(), weight);
        let bias = self.initializer(format!("{name}.bias"), vec![out_channels], bias);

        self.push(
            Op::Conv2d {
                weight,
                bias: Some(bias),
                stride: conv.stride,
                padding: explicit_padding(&conv.padding.0, [kh, kw]),
                dilation: conv.dilation,
                groups: conv.groups,
            },
            vec![input],
        )
    }

    pub fn relu(&mut self, input: ValueId) -> ValueId {
        self.push(Op::Relu, vec![input])
    }

    pub fn finish(
        self,
        output: ValueId,
        model: &ModelConfig,
        preprocess: &PreprocessConfig,
        source_hash: &str,
    ) -> Graph {
        Graph {
            header: GraphHeader {
                opset: GRAPH_OPSET,
                input_channels: 3,
                input_height: model.image_height,
                input_width: model.image_width,
                preprocess: preprocess.clone(),
                source_hash: source_hash.to_owned(),
                nodes: self.nodes,
                output,
                initializers: self.initializers,
            },
            weights: self.weights,
        }
    }
}

/// A module that can emit itself into a [`GraphBuilder`].
pub trait Trace {
    type Output;

    fn trace(&self, builder: &mut GraphBuilder, name: &str, input: ValueId) -> Self::Output;
}

impl<B: Backend> Trace for BasicBlock<B> {
    type Output = ValueId;

    fn trace(&self, builder: &mut GraphBuilder, name: &str, input: ValueId) -> ValueId {
        let out = builder.conv(&format!("{name}.conv1"), &self.conv1, Some(&self.bn1), input);
        let out = builder.relu(out);
        let out = builder.conv(&format!("{name}.conv2"), &self.conv2, Some(&self.bn2), out);

        let identity = match &self.downsample {
            Some(ds) => builder.conv(&format!("{name}.downsample"), &ds.conv, Some(&ds.bn), input),
            None => input,
        };

        let sum = builder.push(Op::Add, vec![out, identity]);
        builder.relu(sum)
    }
}

impl<B: Backend> Trace for LayerBlock<B> {
    type Output = ValueId;

    fn trace(&self, builder: &mut GraphBuilder, name: &str, input: ValueId) -> ValueId {
        self.blocks
            .iter()
            .enumerate()
            .fold(input, |x, (i, block)| block.trace(builder, &format!("{name}.{i}"), x))
    }
}

impl<B: Backend> Trace for ResNetEncoder<B> {
    type Output = [ValueId; 5];

    fn trace(&self, builder: &mut GraphBuilder, name: &str, input: ValueId) -> [ValueId; 5] {
        let stem = builder.conv(&format!("{name}.conv1"), &self.conv1, Some(&self.bn1), input);
        let stem = builder.relu(stem);

        let pooled = builder.push(
            Op::MaxPool2d {
                kernel: resnet::STEM_POOL_KERNEL,
                stride: resnet::STEM_POOL_STRIDE,
                padding: resnet::STEM_POOL_PADDING,
            },
            vec![stem],
        );

        let f1 = self.layer1.trace(builder, &format!("{name}.layer1"), pooled);
        let f2 = self.layer2.trace(builder, &format!("{name}.layer2"), f1);
        let f3 = self.layer3.trace(builder, &format!("{name}.layer3"), f2);
        let f4 = self.layer4.trace(builder, &format!("{name}.layer4"), f3);
        [stem, f1, f2, f3, f4]
    }
}

impl<B: Backend> Trace for ConvBnRelu<B> {
    type Output = ValueId;

    fn trace(&self, builder: &mut GraphBuilder, name: &str, input: ValueId) -> ValueId {
        let out = builder.conv(name, &self.conv, Some(&self.bn), input);
        builder.relu(out)
    }
}

impl<B: Backend> DecoderBlock<B> {
    fn trace_with_skip(
        &self,
        builder: &mut GraphBuilder,
        name: &str,
        input: ValueId,
        skip: Option<ValueId>,
    ) -> ValueId {
        let x = builder.push(
            Op::UpsampleNearest {
                scale: DECODER_SCALE,
            },
            vec![input],
        );
        let x = match skip {
            Some(skip) => builder.push(Op::Concat, vec![x, skip]),
            None => x,
        };
        let x = self.conv1.trace(builder, &format!("{name}.conv1"), x);
        self.conv2.trace(builder, &format!("{name}.conv2"), x)
    }
}

impl<B: Backend> UnetDecoder<B> {
    fn trace_features(&self, builder: &mut GraphBuilder, name: &str, features: [ValueId; 5]) -> ValueId {
        let [stem, f1, f2, f3, f4] = features;
        let skips = [Some(f3), Some(f2), Some(f1), Some(stem), None];

        self.blocks
            .iter()
            .zip(skips)
            .enumerate()
            .fold(f4, |x, (i, (block, skip))| {
                block.trace_with_skip(builder, &format!("{name}.blocks.{i}"), x, skip)
            })
    }
}

/// Traces `model` at the resolution of `model_config`.
pub fn trace_model<B: Backend>(
    model: &StrokeUNet<B>,
    model_config: &ModelConfig,
    preprocess: &PreprocessConfig,
    source_hash: &str,
) -> Graph {
    let mut builder = GraphBuilder::new();

    let features = model.encoder.trace(&mut builder, "encoder", INPUT_VALUE);
    let decoded = model.decoder.trace_features(&mut builder, "decoder", features);
    let logits = builder.conv("head", &model.head, None, decoded);

    let graph = builder.finish(logits, model_config, preprocess, source_hash);
    tracing::debug!(
        nodes = graph.header.nodes.len(),
        initializers = graph.header.initializers.len(),
        weights = graph.weights.len(),
        "model traced"
    );
    graph
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::test_utils::{tiny_config, TestBackend};

    #[test]
    fn traced_graph_is_well_formed() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device).unwrap();

        let graph = trace_model(&model, &config, &PreprocessConfig::new(), "hash");
        graph.validate(&PathBuf::from("mem")).unwrap();

        let count = |name: &str| {
            graph
                .header
                .nodes
                .iter()
                .filter(|n| n.op.name() == name)
                .count()
        };
        // resnet18: stem + 8 blocks x 2 + 3 downsamples; decoder: 5 x 2; head.
        assert_eq!(count("Conv2d"), 1 + 16 + 3 + 10 + 1);
        assert_eq!(count("MaxPool2d"), 1);
        assert_eq!(count("Add"), 8);
        assert_eq!(count("Concat"), 4);
        assert_eq!(count("UpsampleNearest"), 5);
        assert_eq!(graph.header.source_hash, "hash");
        assert_eq!(graph.input_size(), [64, 64]);
    }

    #[test]
    fn folding_preserves_non_trivial_batch_norm() {
        let device = Default::default();
        let conv = burn::nn::conv::Conv2dConfig::new([1, 2], [1, 1]).init::<TestBackend>(&device);
        let mut bn = burn::nn::BatchNormConfig::new(2).init::<TestBackend, 2>(&device);
        bn.gamma = burn::module::Param::from_tensor(Tensor::from_floats([2.0, 0.5], &device));
        bn.beta = burn::module::Param::from_tensor(Tensor::from_floats([1.0, -1.0], &device));

        let mut builder = GraphBuilder::new();
        builder.conv("c", &conv, Some(&bn), INPUT_VALUE);

        let weights = host(conv.weight.val());
        let bias = host(conv.bias.as_ref().unwrap().val());
        let scale = [2.0 / (1.0f32 + 1e-5).sqrt(), 0.5 / (1.0f32 + 1e-5).sqrt()];

        // Layout: weight (2 values), bias (2 values).
        for o in 0..2 {
            assert!((builder.weights[o] - weights[o] * scale[o]).abs() < 1e-5);
            let expected_bias = bias[o] * scale[o] + [1.0, -1.0][o];
            assert!((builder.weights[2 + o] - expected_bias).abs() < 1e-5);
        }
    }
}
