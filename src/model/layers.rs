use burn::module::{Module, ModuleVisitor, ParamId};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;

/// Variance scaling initializer used by every regularised dense layer
/// (`std = sqrt(2 / fan_in)`).
pub fn he_initializer() -> Initializer {
    Initializer::KaimingNormal {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: false,
    }
}

pub fn he_linear<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_initializer(he_initializer())
        .init(device)
}

struct SquaredNorm<B: Backend> {
    total: Option<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for SquaredNorm<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let term = tensor.clone().powf_scalar(2.0).sum();
        self.total = Some(match self.total.take() {
            Some(total) => total + term,
            None => term,
        });
    }
}

/// Sum of squares of every float parameter of `module`, as a single-element tensor.
///
/// Modules without parameters contribute zero.
pub fn squared_norm<B: Backend, M: Module<B>>(module: &M, device: &B::Device) -> Tensor<B, 1> {
    let mut visitor = SquaredNorm { total: None };
    module.visit(&mut visitor);
    visitor
        .total
        .unwrap_or_else(|| Tensor::zeros([1], device))
}

/// Batch normalisation over a `[batch, time, features]` stream.
///
/// The global flavour keeps one statistic per feature, computed over batch
/// and time. The temporal flavour keeps one statistic per timestep, computed
/// over batch and features, and is therefore tied to a fixed stream length.
#[derive(Module, Debug)]
pub struct StreamNorm<B: Backend> {
    norm: BatchNorm<B, 1>,
    temporal: bool,
    channels: usize,
}

impl<B: Backend> StreamNorm<B> {
    pub fn global(features: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(features).init(device),
            temporal: false,
            channels: features,
        }
    }

    pub fn temporal(length: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(length).init(device),
            temporal: true,
            channels: length,
        }
    }

    /// Global over `features` or temporal over `length`, depending on `temporal`.
    pub fn new(temporal: bool, length: usize, features: usize, device: &B::Device) -> Self {
        if temporal {
            Self::temporal(length, device)
        } else {
            Self::global(features, device)
        }
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal
    }

    /// Length (temporal) or width (global) this norm was built for.
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        if self.temporal {
            self.norm.forward(x)
        } else {
            self.norm.forward(x.swap_dims(1, 2)).swap_dims(1, 2)
        }
    }
}

/// `[BatchNorm?] -> Dropout -> ReLU -> Linear` on flat `[batch, features]` input.
#[derive(Module, Debug)]
pub struct DenseUnit<B: Backend> {
    norm: Option<BatchNorm<B, 0>>,
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> DenseUnit<B> {
    pub fn new(
        d_input: usize,
        d_output: usize,
        dropout: f64,
        batch_norm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            norm: batch_norm.then(|| BatchNormConfig::new(d_input).init(device)),
            dropout: DropoutConfig::new(dropout).init(),
            linear: he_linear(d_input, d_output, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = self.dropout.forward(x);
        self.linear.forward(relu(x))
    }

    pub fn linear(&self) -> &Linear<B> {
        &self.linear
    }
}

/// Average or max pooling over time with window and stride `window`.
///
/// Trailing timesteps that do not fill a whole window are dropped.
pub fn pool_time<B: Backend>(x: Tensor<B, 3>, window: usize, max: bool) -> Tensor<B, 3> {
    let [batch, time, features] = x.dims();
    let steps = time / window;
    let grouped = x
        .narrow(1, 0, steps * window)
        .reshape([batch, steps, window, features]);
    let pooled = if max {
        grouped.max_dim(2)
    } else {
        grouped.mean_dim(2)
    };
    pooled.reshape([batch, steps, features])
}
