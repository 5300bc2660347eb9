use burn::config::Config;
use burn::module::{Ignored, Module, ParamId};
use burn::nn::{Dropout, DropoutConfig, Linear};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;

use super::layers::{he_linear, squared_norm, StreamNorm};
use super::signature::StreamKind;
use crate::error::ModelError;

#[derive(Config, Debug)]
pub struct EmbedderConfig {
    pub d_model: usize,

    #[config(default = 2)]
    pub layers: usize,

    #[config(default = 25)]
    pub d_hidden: usize,

    #[config(default = 0.1)]
    pub dropout: f64,

    #[config(default = true)]
    pub batch_norm: bool,

    #[config(default = false)]
    pub temporal_norm: bool,

    #[config(default = true)]
    pub residual: bool,

    /// Bind every stream to one block of dense layers instead of one block per stream.
    #[config(default = false)]
    pub shared: bool,

    #[config(default = 0.001)]
    pub l2_weight: f64,
}

/// The dense layers of one refiner block, in factory order: index 0 projects
/// back to the model width and runs last, indices `1..` project to the hidden
/// width and run first.
#[derive(Module, Debug)]
pub struct EmbedderLayers<B: Backend> {
    dense: Vec<Linear<B>>,
    dropout: Dropout,
}

impl<B: Backend> EmbedderLayers<B> {
    pub fn new(
        d_model: usize,
        layers: usize,
        d_hidden: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let mut dense = Vec::with_capacity(layers);
        if layers > 0 {
            let d_last = if layers > 1 { d_hidden } else { d_model };
            dense.push(he_linear(d_last, d_model, device));
        }
        for i in 1..layers {
            let d_in = if i == 1 { d_model } else { d_hidden };
            dense.push(he_linear(d_in, d_hidden, device));
        }

        Self {
            dense,
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Input width of dense layer `index`.
    pub fn input_width(&self, index: usize) -> usize {
        self.dense[index].weight.dims()[0]
    }

    fn execution_order(&self) -> impl Iterator<Item = usize> {
        (1..self.dense.len()).chain(std::iter::once(0))
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        norms: Option<&[StreamNorm<B>]>,
        residual: bool,
    ) -> Tensor<B, 3> {
        let mut h = x.clone();
        for index in self.execution_order() {
            if let Some(norm) = norms.and_then(|norms| norms.get(index)) {
                h = norm.forward(h);
            }
            h = self.dropout.forward(h);
            h = self.dense[index].forward(relu(h));
        }
        if residual {
            h + x
        } else {
            h
        }
    }

    /// Weight and bias ids of every dense layer, in layer order.
    pub fn param_ids(&self) -> Vec<ParamId> {
        self.dense
            .iter()
            .flat_map(|linear| {
                std::iter::once(linear.weight.id.clone())
                    .chain(linear.bias.as_ref().map(|bias| bias.id.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBinding {
    pub stream: StreamKind,
    pub block: usize,
    pub norms: Option<usize>,
}

/// Registry of refiner blocks with an explicit stream-to-block binding.
///
/// In independent mode every stream owns a block and a norm set. In shared
/// mode every stream is bound to block 0; norm sets are shared too, except
/// under temporal batch norm where the text stream keeps its own set because
/// its temporal axis has a different length.
#[derive(Module, Debug)]
pub struct EmbedderBank<B: Backend> {
    blocks: Vec<EmbedderLayers<B>>,
    norm_sets: Vec<Vec<StreamNorm<B>>>,
    bindings: Ignored<Vec<StreamBinding>>,
    residual: bool,
    l2_weight: f64,
}

impl EmbedderConfig {
    /// Builds the bank for `streams` (each with its length), or `None` when
    /// zero layers are requested.
    pub fn init<B: Backend>(
        &self,
        streams: &[(StreamKind, usize)],
        device: &B::Device,
    ) -> Result<Option<EmbedderBank<B>>, ModelError> {
        if self.layers == 0 {
            return Ok(None);
        }
        if self.d_model == 0 {
            return Err(ModelError::ZeroWidth {
                component: "embedder",
                field: "d_model",
            });
        }
        if self.layers > 1 && self.d_hidden == 0 {
            return Err(ModelError::ZeroWidth {
                component: "embedder",
                field: "d_hidden",
            });
        }
        for (stream, length) in streams {
            if *length == 0 {
                return Err(ModelError::EmptyStream {
                    stream: stream.name(),
                });
            }
        }

        let new_block = || {
            EmbedderLayers::new(
                self.d_model,
                self.layers,
                self.d_hidden,
                self.dropout,
                device,
            )
        };

        let mut blocks = Vec::new();
        let mut norm_sets: Vec<Vec<StreamNorm<B>>> = Vec::new();
        let mut set_lengths: Vec<(bool, usize)> = Vec::new();
        let mut bindings = Vec::with_capacity(streams.len());

        if self.shared {
            blocks.push(new_block());
        }

        for &(stream, length) in streams {
            let block = if self.shared {
                0
            } else {
                blocks.push(new_block());
                blocks.len() - 1
            };

            let norms = if !self.batch_norm {
                None
            } else if self.shared {
                let is_text = stream == StreamKind::Text && self.temporal_norm;
                match set_lengths.iter().position(|(text, _)| *text == is_text) {
                    Some(index) => {
                        let expected = set_lengths[index].1;
                        if self.temporal_norm && expected != length {
                            return Err(ModelError::WidthMismatch {
                                component: "shared temporal norm",
                                expected,
                                actual: length,
                            });
                        }
                        Some(index)
                    }
                    None => {
                        norm_sets.push(self.norm_set(&blocks[block], length, device));
                        set_lengths.push((is_text, length));
                        Some(norm_sets.len() - 1)
                    }
                }
            } else {
                norm_sets.push(self.norm_set(&blocks[block], length, device));
                Some(norm_sets.len() - 1)
            };

            bindings.push(StreamBinding {
                stream,
                block,
                norms,
            });
        }

        Ok(Some(EmbedderBank {
            blocks,
            norm_sets,
            bindings: Ignored(bindings),
            residual: self.residual,
            l2_weight: self.l2_weight,
        }))
    }

    fn norm_set<B: Backend>(
        &self,
        block: &EmbedderLayers<B>,
        length: usize,
        device: &B::Device,
    ) -> Vec<StreamNorm<B>> {
        (0..block.len())
            .map(|index| {
                StreamNorm::new(self.temporal_norm, length, block.input_width(index), device)
            })
            .collect()
    }
}

impl<B: Backend> EmbedderBank<B> {
    fn binding(&self, stream: StreamKind) -> Result<&StreamBinding, ModelError> {
        self.bindings
            .0
            .iter()
            .find(|binding| binding.stream == stream)
            .ok_or(ModelError::UnboundStream {
                stream: stream.name(),
            })
    }

    pub fn forward(&self, stream: StreamKind, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ModelError> {
        let binding = self.binding(stream)?;
        let norms = binding
            .norms
            .and_then(|index| self.norm_sets.get(index))
            .map(|set| set.as_slice());
        let block = self
            .blocks
            .get(binding.block)
            .ok_or(ModelError::UnboundStream {
                stream: stream.name(),
            })?;
        Ok(block.forward(x, norms, self.residual))
    }

    /// Index of the block `stream` runs through.
    pub fn block_for(&self, stream: StreamKind) -> Option<usize> {
        self.binding(stream).ok().map(|binding| binding.block)
    }

    pub fn bindings(&self) -> &[StreamBinding] {
        &self.bindings.0
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn param_ids(&self, stream: StreamKind) -> Vec<ParamId> {
        self.block_for(stream)
            .and_then(|index| self.blocks.get(index))
            .map(|block| block.param_ids())
            .unwrap_or_default()
    }

    pub fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        self.blocks
            .iter()
            .map(|block| squared_norm(block, device))
            .fold(Tensor::zeros([1], device), |acc, term| acc + term)
            .mul_scalar(self.l2_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::{AdamConfig, GradientsParams, Optimizer};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    const STREAMS: [(StreamKind, usize); 3] = [
        (StreamKind::Text, 12),
        (StreamKind::Source, 5),
        (StreamKind::Target, 5),
    ];

    fn config(shared: bool) -> EmbedderConfig {
        EmbedderConfig::new(8)
            .with_layers(3)
            .with_d_hidden(4)
            .with_dropout(0.0)
            .with_shared(shared)
    }

    #[test]
    fn test_zero_layers_builds_nothing() {
        let device = Default::default();
        let bank = config(true)
            .with_layers(0)
            .init::<TestBackend>(&STREAMS, &device)
            .unwrap();
        assert!(bank.is_none());
    }

    #[test]
    fn test_factory_order_ends_with_projection_to_model_width() {
        let device = Default::default();
        let layers = EmbedderLayers::<TestBackend>::new(8, 3, 4, 0.0, &device);
        assert_eq!(layers.len(), 3);
        assert_eq!(layers.input_width(1), 8);
        assert_eq!(layers.input_width(2), 4);
        assert_eq!(layers.input_width(0), 4);
        assert_eq!(layers.dense[0].weight.dims(), [4, 8]);
    }

    #[test]
    fn test_shared_bank_binds_streams_to_one_block() {
        let device = Default::default();
        let bank = config(true)
            .init::<TestBackend>(&STREAMS, &device)
            .unwrap()
            .unwrap();

        assert_eq!(bank.num_blocks(), 1);
        assert_eq!(bank.block_for(StreamKind::Source), Some(0));
        assert_eq!(bank.block_for(StreamKind::Target), Some(0));
        assert_eq!(bank.block_for(StreamKind::Text), Some(0));
        // Three layers, each with a weight and a bias.
        assert_eq!(bank.param_ids(StreamKind::Source).len(), 6);
        assert_eq!(
            bank.param_ids(StreamKind::Source),
            bank.param_ids(StreamKind::Target)
        );

        let x = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Normal(0.0, 1.0), &device);
        let source = bank.forward(StreamKind::Source, x.clone()).unwrap();
        let target = bank.forward(StreamKind::Target, x).unwrap();
        source.into_data().assert_eq(&target.into_data(), true);
    }

    #[test]
    fn test_independent_bank_has_distinct_parameters() {
        let device = Default::default();
        let bank = config(false)
            .init::<TestBackend>(&STREAMS, &device)
            .unwrap()
            .unwrap();

        assert_eq!(bank.num_blocks(), 3);
        let source = bank.param_ids(StreamKind::Source);
        let target = bank.param_ids(StreamKind::Target);
        assert_eq!(source.len(), 6);
        assert_eq!(target.len(), 6);
        assert!(source.iter().all(|id| !target.contains(id)));
    }

    #[test]
    fn test_shared_temporal_norm_keeps_text_separate() {
        let device = Default::default();
        let bank = config(true)
            .with_temporal_norm(true)
            .init::<TestBackend>(&STREAMS, &device)
            .unwrap()
            .unwrap();

        let norms_of = |stream| {
            bank.bindings()
                .iter()
                .find(|b| b.stream == stream)
                .and_then(|b| b.norms)
        };
        assert_eq!(norms_of(StreamKind::Source), norms_of(StreamKind::Target));
        assert_ne!(norms_of(StreamKind::Text), norms_of(StreamKind::Source));

        let text = Tensor::<TestBackend, 3>::zeros([2, 12, 8], &device);
        assert_eq!(bank.forward(StreamKind::Text, text).unwrap().dims(), [2, 12, 8]);
    }

    #[test]
    fn test_unbound_stream_is_an_error() {
        let device = Default::default();
        let bank = config(false)
            .init::<TestBackend>(&STREAMS[1..], &device)
            .unwrap()
            .unwrap();

        let x = Tensor::<TestBackend, 3>::zeros([1, 12, 8], &device);
        assert_eq!(
            bank.forward(StreamKind::Text, x).unwrap_err(),
            ModelError::UnboundStream { stream: "text" }
        );
    }

    fn update_from_source(shared: bool) -> (bool, bool) {
        let device = Default::default();
        let bank = config(shared)
            .with_batch_norm(false)
            .init::<TestAutodiffBackend>(&STREAMS[1..], &device)
            .unwrap()
            .unwrap();
        let x = Tensor::<TestAutodiffBackend, 3>::random(
            [2, 5, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let source_before = bank.forward(StreamKind::Source, x.clone()).unwrap();
        let target_before = bank.forward(StreamKind::Target, x.clone()).unwrap();

        let loss = source_before.clone().powf_scalar(2.0).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &bank);
        let mut optimizer = AdamConfig::new().init();
        let bank = optimizer.step(0.1, bank, grads);

        let source_after = bank.forward(StreamKind::Source, x.clone()).unwrap();
        let target_after = bank.forward(StreamKind::Target, x).unwrap();

        let changed = |before: Tensor<TestAutodiffBackend, 3>, after: Tensor<TestAutodiffBackend, 3>| {
            let delta: f32 = (before - after).abs().sum().into_scalar();
            delta > 1e-6
        };
        (
            changed(source_before, source_after),
            changed(target_before, target_after),
        )
    }

    #[test]
    fn test_shared_update_is_visible_in_both_streams() {
        let (source_changed, target_changed) = update_from_source(true);
        assert!(source_changed);
        assert!(target_changed);
    }

    #[test]
    fn test_independent_update_stays_in_its_stream() {
        let (source_changed, target_changed) = update_from_source(false);
        assert!(source_changed);
        assert!(!target_changed);
    }
}
