//! Executes compiled engine plans on a Burn backend.

use std::path::PathBuf;

use burn::{
    nn::{
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{activation::relu, module::conv2d, ops::ConvOptions, TensorData},
};
use burn_extra_ops::TensorExtraOps;

use super::graph::{Initializer, Op, ValueId, INPUT_VALUE};
use crate::{
    error::{StrokeSegError, StrokeSegResult},
    models::upsample_nearest,
};

/// Loads initializer `index` as a rank-`D` tensor.
pub(crate) fn param_tensor<B: Backend, const D: usize>(
    initializers: &[Initializer],
    weights: &[f32],
    index: usize,
    device: &B::Device,
) -> Option<Tensor<B, D>> {
    let init = initializers.get(index)?;
    if init.shape.len() != D {
        return None;
    }
    let values = weights.get(init.offset..init.offset + init.len())?;
    Some(Tensor::from_data(
        TensorData::new(values.to_vec(), init.shape.clone()),
        device,
    ))
}

#[derive(Debug)]
enum Kernel<B: Backend> {
    Conv {
        weight: Tensor<B, 4>,
        bias: Option<Tensor<B, 1>>,
        options: ConvOptions<2>,
        fused_relu: bool,
    },
    Relu,
    MaxPool(MaxPool2d),
    Add,
    Concat,
    Upsample(usize),
}

#[derive(Debug)]
struct Step<B: Backend> {
    kernel: Kernel<B>,
    inputs: Vec<ValueId>,
    output: ValueId,
    /// Values that are dead once this step has run.
    release: Vec<ValueId>,
}

/// A prepared step list with its tensors resident on one device.
#[derive(Debug)]
pub struct Executor<B: Backend> {
    steps: Vec<Step<B>>,
    output: ValueId,
    values: usize,
    input_shape: [usize; 3],
    round_activations: bool,
    origin: PathBuf,
}

/// One operation as handed to [`Executor::new`].
pub(crate) struct StepSpec<'a> {
    pub op: &'a Op,
    pub fused_relu: bool,
    pub inputs: &'a [ValueId],
    pub output: ValueId,
}

impl<B: Backend> Executor<B> {
    /// Uploads parameters and plans when each value can be released.
    ///
    /// `origin` labels errors about the artifact the steps came from.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<'a>(
        specs: impl IntoIterator<Item = StepSpec<'a>>,
        initializers: &[Initializer],
        weights: &[f32],
        output: ValueId,
        input_shape: [usize; 3],
        round_activations: bool,
        origin: PathBuf,
        device: &B::Device,
    ) -> StrokeSegResult<Self> {
        let mut steps = Vec::new();
        let mut values = INPUT_VALUE + 1;

        for planned in specs {
            let kernel = match planned.op {
                Op::Conv2d {
                    weight,
                    bias,
                    stride,
                    padding,
                    dilation,
                    groups,
                } => {
                    let missing = || StrokeSegError::ArtifactFormat {
                        path: origin.clone(),
                        reason: format!("convolution producing value {} has bad parameters", planned.output),
                    };
                    let weight = param_tensor(initializers, weights, *weight, device).ok_or_else(missing)?;
                    let bias = match bias {
                        Some(b) => Some(param_tensor(initializers, weights, *b, device).ok_or_else(missing)?),
                        None => None,
                    };
                    Kernel::Conv {
                        weight,
                        bias,
                        options: ConvOptions::new(*stride, *padding, *dilation, *groups),
                        fused_relu: planned.fused_relu,
                    }
                }
                Op::Relu => Kernel::Relu,
                Op::MaxPool2d {
                    kernel,
                    stride,
                    padding,
                } => Kernel::MaxPool(
                    MaxPool2dConfig::new(*kernel)
                        .with_strides(*stride)
                        .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
                        .init(),
                ),
                Op::Add => Kernel::Add,
                Op::Concat => Kernel::Concat,
                Op::UpsampleNearest { scale } => Kernel::Upsample(*scale),
            };

            values = values.max(planned.output + 1);
            steps.push(Step {
                kernel,
                inputs: planned.inputs.to_vec(),
                output: planned.output,
                release: Vec::new(),
            });
        }

        let mut last_use = vec![None; values];
        for (i, step) in steps.iter().enumerate() {
            for &v in &step.inputs {
                if let Some(slot) = last_use.get_mut(v) {
                    *slot = Some(i);
                }
            }
        }
        for (value, last) in last_use.into_iter().enumerate() {
            if let Some(i) = last.filter(|_| value != output) {
                steps[i].release.push(value);
            }
        }

        Ok(Self {
            steps,
            output,
            values,
            input_shape,
            round_activations,
            origin,
        })
    }

    /// Expected `[C, H, W]` of one input item.
    pub const fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    /// Runs the steps on a `[N, C, H, W]` batch and returns the output value.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for an input of the
    /// wrong shape and `Err(StrokeSegError::ArtifactFormat)` if a step reads a
    /// value that was never produced.
    pub fn run(&self, input: Tensor<B, 4>) -> StrokeSegResult<Tensor<B, 4>> {
        let [_, c, h, w] = input.dims();
        if [c, h, w] != self.input_shape {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!(
                    "input items are {:?}, expected {:?}",
                    [c, h, w],
                    self.input_shape
                ),
            });
        }

        let mut slots: Vec<Option<Tensor<B, 4>>> = vec![None; self.values];
        slots[INPUT_VALUE] = Some(self.maybe_round(input));

        for step in &self.steps {
            let mut args = Vec::with_capacity(step.inputs.len());
            for &v in &step.inputs {
                let value = slots.get(v).and_then(Option::as_ref).ok_or_else(|| {
                    StrokeSegError::ArtifactFormat {
                        path: self.origin.clone(),
                        reason: format!("value {v} read before it was produced"),
                    }
                })?;
                args.push(value.clone());
            }

            let out = step.kernel.apply(args).ok_or_else(|| StrokeSegError::ArtifactFormat {
                path: self.origin.clone(),
                reason: format!("step producing value {} is missing inputs", step.output),
            })?;
            let out = self.maybe_round(out);
            for &v in &step.release {
                slots[v] = None;
            }
            slots[step.output] = Some(out);
        }

        slots
            .get_mut(self.output)
            .and_then(Option::take)
            .ok_or_else(|| StrokeSegError::ArtifactFormat {
                path: self.origin.clone(),
                reason: format!("output value {} was never produced", self.output),
            })
    }

    fn maybe_round(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.round_activations {
            x.round_to_half()
        } else {
            x
        }
    }
}

impl<B: Backend> Kernel<B> {
    /// `None` when `args` is shorter than the operator's arity.
    fn apply(&self, args: Vec<Tensor<B, 4>>) -> Option<Tensor<B, 4>> {
        let mut args = args.into_iter();
        let x = args.next()?;

        Some(match self {
            Self::Conv {
                weight,
                bias,
                options,
                fused_relu,
            } => {
                let y = conv2d(x, weight.clone(), bias.clone(), options.clone());
                if *fused_relu {
                    relu(y)
                } else {
                    y
                }
            }
            Self::Relu => relu(x),
            Self::MaxPool(pool) => pool.forward(x),
            Self::Add => x + args.next()?,
            Self::Concat => Tensor::cat(std::iter::once(x).chain(args).collect(), 1),
            Self::Upsample(scale) => upsample_nearest(x, *scale),
        })
    }
}
