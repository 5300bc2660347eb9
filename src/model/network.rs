use burn::module::{Ignored, Module};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use tracing::debug;

use super::attention::{AttendedStream, CrossAttention, CrossAttentionConfig};
use super::config::{
    Architecture, CoAttentionSettings, NetworkConfig, PoolingKind, RecurrentSettings,
    ScaledAttentionSettings,
};
use super::embedder::{EmbedderBank, EmbedderConfig};
use super::heads::OutputHeads;
use super::layers::{he_linear, pool_time, squared_norm, StreamNorm};
use super::link::LabelPartition;
use super::lookup::FrozenLookup;
use super::masking::{masked_mean, Distribution};
use super::recurrent::{BiLstmTower, MergeMode, RecurrentTowers};
use super::residual::{ResidualConfig, ResidualTrunk};
use super::self_attention::{AttentionMergeBlock, MaskedStream};
use super::signature::{
    ArgumentBatch, ArgumentOutput, InputKind, InputName, InputSpec, ModelSignature, OutputName,
    OutputSpec, StreamInput, StreamKind,
};
use crate::error::ModelError;

/// Batch norm and dropout applied to every stream right after the embedder.
#[derive(Module, Debug)]
pub struct EntryStage<B: Backend> {
    text: Option<StreamNorm<B>>,
    source: Option<StreamNorm<B>>,
    target: Option<StreamNorm<B>>,
    dropout: Dropout,
}

impl<B: Backend> EntryStage<B> {
    /// With `shared` the propositions use one norm and, under global batch
    /// norm, the text uses it as well.
    fn new(
        config: &NetworkConfig,
        width: usize,
        with_text: bool,
        shared: bool,
        device: &B::Device,
    ) -> Self {
        let norm = |length: usize| {
            config
                .bn_embed
                .then(|| StreamNorm::new(config.temporal_norm, length, width, device))
        };
        let text_owns_norm = with_text && (!shared || config.temporal_norm);
        Self {
            text: if text_owns_norm {
                norm(config.text_length)
            } else {
                None
            },
            source: norm(config.proposition_length),
            target: if shared {
                None
            } else {
                norm(config.proposition_length)
            },
            dropout: DropoutConfig::new(config.dropout_embedder).init(),
        }
    }

    fn forward(&self, stream: StreamKind, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let norm = match stream {
            StreamKind::Text => self.text.as_ref().or(self.source.as_ref()),
            StreamKind::Source => self.source.as_ref(),
            StreamKind::Target => self.target.as_ref().or(self.source.as_ref()),
        };
        let x = match norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        self.dropout.forward(x)
    }
}

/// Concatenation of the stream vectors followed by the dense layer, the
/// residual trunk and the final norm and dropout.
#[derive(Module, Debug)]
pub struct MergeStage<B: Backend> {
    norm: Option<BatchNorm<B, 0>>,
    dropout: Dropout,
    dense: Linear<B>,
    trunk: ResidualTrunk<B>,
    final_norm: Option<BatchNorm<B, 0>>,
    final_dropout: Dropout,
    d_input: usize,
    l2_weight: f64,
}

impl<B: Backend> MergeStage<B> {
    fn new(
        config: &NetworkConfig,
        d_input: usize,
        final_size: usize,
        res_size: usize,
        residual: bool,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        if final_size == 0 {
            return Err(ModelError::ZeroWidth {
                component: "merge",
                field: "final_size",
            });
        }
        let trunk = ResidualConfig::new(final_size)
            .with_blocks(config.resnet_blocks)
            .with_layers_per_block(config.resnet_layers)
            .with_d_hidden(res_size)
            .with_dropout(config.dropout_resnet)
            .with_batch_norm(config.bn_res)
            .with_residual(residual)
            .with_l2_weight(config.l2_weight)
            .init(device)?;

        Ok(Self {
            norm: config
                .bn_res
                .then(|| BatchNormConfig::new(d_input).init(device)),
            dropout: DropoutConfig::new(config.dropout_resnet).init(),
            dense: he_linear(d_input, final_size, device),
            trunk,
            final_norm: config
                .bn_final
                .then(|| BatchNormConfig::new(final_size).init(device)),
            final_dropout: DropoutConfig::new(config.dropout_final).init(),
            d_input,
            l2_weight: config.l2_weight,
        })
    }

    fn forward(&self, vectors: Vec<Tensor<B, 2>>) -> Result<Tensor<B, 2>, ModelError> {
        let x = Tensor::cat(vectors, 1);
        let width = x.dims()[1];
        if width != self.d_input {
            return Err(ModelError::WidthMismatch {
                component: "merge",
                expected: self.d_input,
                actual: width,
            });
        }
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = relu(self.dense.forward(self.dropout.forward(x)));
        let x = self.trunk.forward(x);
        let x = match &self.final_norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        Ok(self.final_dropout.forward(x))
    }

    fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        squared_norm(&self.dense, device).mul_scalar(self.l2_weight)
            + self.trunk.l2_penalty(device)
    }
}

#[derive(Debug, Clone, Copy)]
struct Pooling {
    window: usize,
    max: bool,
}

impl Pooling {
    fn apply<B: Backend>(self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        pool_time(x, self.window, self.max)
    }
}

#[derive(Debug, Clone)]
struct Layout {
    architecture: Architecture,
    signature: ModelSignature,
    context: bool,
    mark: bool,
    proposition_pooling: Option<Pooling>,
    text_pooling: Option<Pooling>,
    l2_weight: f64,
}

/// A stream after lookup, refinement and entry normalisation, with the
/// padding mask of its raw input.
struct Encoded<B: Backend> {
    features: Tensor<B, 3>,
    padding: Tensor<B, 2>,
}

struct EncodedBatch<B: Backend> {
    text: Option<Encoded<B>>,
    source: Encoded<B>,
    target: Encoded<B>,
    distance: Option<Tensor<B, 2>>,
    mark: Option<Tensor<B, 3>>,
}

/// The assembled network: named inputs in, four named distributions out.
#[derive(Module, Debug)]
pub struct ArgumentNet<B: Backend> {
    lookup: Option<FrozenLookup<B>>,
    embedder: Option<EmbedderBank<B>>,
    entry: EntryStage<B>,
    bottleneck: Option<Linear<B>>,
    text_norm: Option<StreamNorm<B>>,
    towers: Option<RecurrentTowers<B>>,
    cross_attention: Option<CrossAttention<B>>,
    merge_attention: Option<AttentionMergeBlock<B>>,
    merge: MergeStage<B>,
    heads: OutputHeads<B>,
    layout: Ignored<Layout>,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterStats {
    pub total_params: usize,
    pub embedder_params: usize,
    pub entry_params: usize,
    pub sequence_params: usize,
    pub attention_params: usize,
    pub merge_params: usize,
    pub head_params: usize,
    pub frozen_params: usize,
}

impl ParameterStats {
    pub fn print_summary(&self, name: &str) {
        println!("=== {} Parameter Summary ===", name);
        println!("Embedder (refiner):    {:>10}", self.embedder_params);
        println!("Entry norms:           {:>10}", self.entry_params);
        println!("Bottleneck + towers:   {:>10}", self.sequence_params);
        println!("Attention:             {:>10}", self.attention_params);
        println!("Merge + trunk:         {:>10}", self.merge_params);
        println!("Heads:                 {:>10}", self.head_params);
        println!("Frozen embeddings:     {:>10}", self.frozen_params);
        println!("Trainable total:       {:>10}", self.total_params);
        println!("================================");
    }
}

fn check_width(component: &'static str, field: &'static str, width: usize) -> Result<(), ModelError> {
    if width == 0 {
        Err(ModelError::ZeroWidth { component, field })
    } else {
        Ok(())
    }
}

fn pooling_for(
    stream: &'static str,
    window: usize,
    kind: PoolingKind,
    length: usize,
) -> Result<Option<Pooling>, ModelError> {
    if window == 0 {
        return Ok(None);
    }
    if window > length {
        return Err(ModelError::PoolingTooLarge {
            stream,
            window,
            length,
        });
    }
    Ok(Some(Pooling {
        window,
        max: kind == PoolingKind::Max,
    }))
}

impl NetworkConfig {
    /// Builds the network for the configured architecture.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ArgumentNet<B>, ModelError> {
        self.outputs.validate()?;
        check_width("network", "embedding_dim", self.embedding_dim)?;
        check_width("network", "proposition_length", self.proposition_length)?;
        if self.architecture.has_text_input() {
            check_width("network", "text_length", self.text_length)?;
        }

        let net = match &self.architecture {
            Architecture::Net7(settings) => build_recurrent(self, settings, true, device),
            Architecture::Net7NonResidual(settings) => {
                build_recurrent(self, settings, false, device)
            }
            Architecture::Net7NoContext(settings) => build_recurrent(self, settings, true, device),
            Architecture::Net8(settings) => build_scaled_attention(self, settings, device),
            Architecture::Net9(settings)
            | Architecture::Net10(settings)
            | Architecture::Net11(settings) => build_co_attention(self, settings, device),
        }?;

        debug!(
            architecture = self.architecture.name(),
            params = net.num_params(),
            "built network"
        );
        Ok(net)
    }

    fn signature(&self) -> ModelSignature {
        let (kind, per_step): (InputKind, Vec<usize>) = match self.vocab_size {
            Some(_) => (InputKind::Tokens, vec![]),
            None => (InputKind::Embedded, vec![self.embedding_dim]),
        };
        let stream_shape = |length: usize| {
            let mut shape = vec![length];
            shape.extend_from_slice(&per_step);
            shape
        };

        let mut inputs = Vec::new();
        if self.architecture.has_text_input() {
            inputs.push(InputSpec {
                name: InputName::Text,
                kind,
                shape: stream_shape(self.text_length),
            });
        }
        inputs.push(InputSpec {
            name: InputName::Source,
            kind,
            shape: stream_shape(self.proposition_length),
        });
        inputs.push(InputSpec {
            name: InputName::Target,
            kind,
            shape: stream_shape(self.proposition_length),
        });
        if self.distance > 0 {
            inputs.push(InputSpec {
                name: InputName::Distance,
                kind: InputKind::Features,
                shape: vec![self.distance_width()],
            });
        }
        if self.uses_mark() {
            inputs.push(InputSpec {
                name: InputName::Mark,
                kind: InputKind::Features,
                shape: vec![self.text_length, 2],
            });
        }

        let outputs = [
            (OutputName::Link, self.outputs.link),
            (OutputName::Relation, self.outputs.relation),
            (OutputName::Source, self.outputs.source),
            (OutputName::Target, self.outputs.target),
        ]
        .into_iter()
        .map(|(name, width)| OutputSpec { name, width })
        .collect();

        ModelSignature { inputs, outputs }
    }

    fn partition(&self) -> Result<Option<LabelPartition>, ModelError> {
        self.link_as_sum
            .clone()
            .map(|groups| LabelPartition::new(groups, self.outputs.relation, self.outputs.link))
            .transpose()
    }

    fn lookup<B: Backend>(&self, device: &B::Device) -> Result<Option<FrozenLookup<B>>, ModelError> {
        self.vocab_size
            .map(|vocab| FrozenLookup::random(vocab, self.embedding_dim, device))
            .transpose()
    }

    fn streams(&self) -> Vec<(StreamKind, usize)> {
        let mut streams = Vec::with_capacity(3);
        if self.uses_context() {
            streams.push((StreamKind::Text, self.text_length));
        }
        streams.push((StreamKind::Source, self.proposition_length));
        streams.push((StreamKind::Target, self.proposition_length));
        streams
    }

    fn embedder<B: Backend>(
        &self,
        d_hidden: usize,
        shared: bool,
        residual: bool,
        device: &B::Device,
    ) -> Result<Option<EmbedderBank<B>>, ModelError> {
        EmbedderConfig::new(self.embedding_dim)
            .with_layers(self.embedder_layers)
            .with_d_hidden(d_hidden)
            .with_dropout(self.dropout_embedder)
            .with_batch_norm(self.bn_embed)
            .with_temporal_norm(self.temporal_norm)
            .with_residual(residual)
            .with_shared(shared)
            .with_l2_weight(self.l2_weight)
            .init(&self.streams(), device)
    }

    fn layout(
        &self,
        proposition_pooling: Option<Pooling>,
        text_pooling: Option<Pooling>,
    ) -> Layout {
        Layout {
            architecture: self.architecture.clone(),
            signature: self.signature(),
            context: self.uses_context(),
            mark: self.uses_mark(),
            proposition_pooling,
            text_pooling,
            l2_weight: self.l2_weight,
        }
    }

    fn norm<B: Backend>(&self, length: usize, width: usize, device: &B::Device) -> Option<StreamNorm<B>> {
        self.bn_embed
            .then(|| StreamNorm::new(self.temporal_norm, length, width, device))
    }

    fn mark_width(&self) -> usize {
        if self.uses_mark() {
            2
        } else {
            0
        }
    }
}

/// Net 7 and its non-residual and context-free variants: bottleneck, optional
/// pooling, BiLSTM final states, merge.
fn build_recurrent<B: Backend>(
    config: &NetworkConfig,
    settings: &RecurrentSettings,
    residual: bool,
    device: &B::Device,
) -> Result<ArgumentNet<B>, ModelError> {
    let hidden = config.embedding_size;
    check_width("net_7", "embedding_size", hidden)?;
    let context = config.uses_context();

    let proposition_pooling = pooling_for(
        "source/target",
        settings.pooling,
        settings.pooling_kind,
        config.proposition_length,
    )?;
    let text_pooling = if context && settings.pooling > 0 {
        let window = if settings.text_pooling > 0 {
            settings.text_pooling
        } else {
            settings.pooling
        };
        pooling_for("text", window, settings.pooling_kind, config.text_length)?
    } else {
        None
    };
    let pooled = |length: usize, pooling: Option<Pooling>| {
        pooling.map_or(length, |p| length / p.window)
    };
    let proposition_steps = pooled(config.proposition_length, proposition_pooling);
    let text_steps = pooled(config.text_length, text_pooling);

    let text_width = hidden + config.mark_width();
    let text_tower = context.then(|| {
        BiLstmTower::new(
            text_width,
            hidden,
            MergeMode::Mul,
            config.norm(text_steps, text_width, device),
            config.dropout_embedder,
            device,
        )
    });
    let proposition_tower = || {
        BiLstmTower::new(
            hidden,
            hidden,
            MergeMode::Mul,
            config.norm(proposition_steps, hidden, device),
            config.dropout_embedder,
            device,
        )
    };
    let source_tower = proposition_tower();
    let target_tower = (!settings.single_tower).then(proposition_tower);

    let merge_width = if context { hidden } else { 0 } + 2 * hidden + config.distance_width();

    Ok(ArgumentNet {
        lookup: config.lookup(device)?,
        embedder: config.embedder(hidden, config.shared_embedder, residual, device)?,
        entry: EntryStage::new(
            config,
            config.embedding_dim,
            context,
            config.shared_embedder,
            device,
        ),
        bottleneck: Some(he_linear(config.embedding_dim, hidden, device)),
        text_norm: None,
        towers: Some(RecurrentTowers::new(
            text_tower,
            source_tower,
            target_tower,
            config.l2_weight,
        )),
        cross_attention: None,
        merge_attention: None,
        merge: MergeStage::new(
            config,
            merge_width,
            config.final_size,
            config.res_size,
            residual,
            device,
        )?,
        heads: OutputHeads::new(
            config.final_size,
            config.outputs,
            config.partition()?,
            Distribution::Softmax,
            device,
        )?,
        layout: Ignored(config.layout(proposition_pooling, text_pooling)),
    })
}

/// Net 9, 10 and 11: cross-attention between source and target.
fn build_co_attention<B: Backend>(
    config: &NetworkConfig,
    settings: &CoAttentionSettings,
    device: &B::Device,
) -> Result<ArgumentNet<B>, ModelError> {
    let hidden = config.embedding_size;
    check_width(config.architecture.name(), "embedding_size", hidden)?;
    let context = config.uses_context();
    let width = config.embedding_dim;

    let (bottleneck, proposition_width) = match config.architecture {
        Architecture::Net10(_) => (None, width),
        _ => (Some(he_linear(width, hidden, device)), hidden),
    };
    let text_width = proposition_width + config.mark_width();

    let (text_norm, towers) = match config.architecture {
        Architecture::Net11(_) => {
            let text_tower = context.then(|| {
                BiLstmTower::new(
                    text_width,
                    hidden,
                    MergeMode::Mul,
                    config.norm(config.text_length, text_width, device),
                    config.dropout_embedder,
                    device,
                )
            });
            let proposition_tower = || {
                BiLstmTower::new(
                    hidden,
                    hidden,
                    MergeMode::Mul,
                    config.norm(config.proposition_length, hidden, device),
                    config.dropout_embedder,
                    device,
                )
            };
            let source_tower = proposition_tower();
            let target_tower = (!settings.single_tower).then(proposition_tower);
            (
                None,
                Some(RecurrentTowers::new(
                    text_tower,
                    source_tower,
                    target_tower,
                    config.l2_weight,
                )),
            )
        }
        _ => (
            if context {
                config.norm(config.text_length, text_width, device)
            } else {
                None
            },
            None,
        ),
    };

    let attention = CrossAttentionConfig::new(proposition_width, proposition_width, hidden)
        .with_shared_keys(settings.shared_keys)
        .with_shared_importance(settings.shared_importance)
        .with_pooling(settings.query_pooling)
        .with_distribution(settings.distribution)
        .init(device)?;

    let text_vector_width = match (context, &towers) {
        (false, _) => 0,
        (true, Some(_)) => hidden,
        (true, None) => text_width,
    };
    let merge_width = text_vector_width + 2 * attention.d_output() + config.distance_width();

    Ok(ArgumentNet {
        lookup: config.lookup(device)?,
        embedder: config.embedder(hidden, config.shared_embedder, true, device)?,
        entry: EntryStage::new(config, width, context, config.shared_embedder, device),
        bottleneck,
        text_norm,
        towers,
        cross_attention: Some(attention),
        merge_attention: None,
        merge: MergeStage::new(
            config,
            merge_width,
            config.final_size,
            config.res_size,
            true,
            device,
        )?,
        heads: OutputHeads::new(
            config.final_size,
            config.outputs,
            config.partition()?,
            Distribution::Softmax,
            device,
        )?,
        layout: Ignored(config.layout(None, None)),
    })
}

/// Net 8: shared refiner, optional space reduction and BiLSTM, attention
/// merge; every hidden width is derived from the input width.
fn build_scaled_attention<B: Backend>(
    config: &NetworkConfig,
    settings: &ScaledAttentionSettings,
    device: &B::Device,
) -> Result<ArgumentNet<B>, ModelError> {
    let width = config.embedding_dim;
    let context = config.uses_context();
    let scaled = |field: &'static str, scale: usize| -> Result<usize, ModelError> {
        let scaled = if scale == 0 { 0 } else { width / scale };
        check_width("net_8", field, scaled)?;
        Ok(scaled)
    };

    let embedding_size = if config.embedder_layers > 0 {
        scaled("embedding_scale", settings.embedding_scale)?
    } else {
        0
    };
    let final_size = scaled("final_scale", settings.final_scale)?;
    let res_size = if config.resnet_layers > 1 {
        scaled("res_scale", settings.res_scale)?
    } else {
        0
    };
    let space = if settings.space_scale > 0 {
        scaled("space_scale", settings.space_scale)?
    } else {
        width
    };

    let bottleneck = (settings.space_scale > 0).then(|| he_linear(width, space, device));

    let towers = if settings.use_lstm {
        let units = space / 2;
        check_width("net_8", "lstm units", units)?;
        let tower = || BiLstmTower::new(space, units, MergeMode::Concat, None, config.dropout_embedder, device);
        Some(RecurrentTowers::new(
            context.then(tower),
            tower(),
            Some(tower()),
            config.l2_weight,
        ))
    } else {
        None
    };
    let d_value = towers
        .as_ref()
        .map_or(space, |towers| towers.source().d_output());

    let merge_attention = AttentionMergeBlock::new(
        settings.merge,
        d_value,
        space,
        context,
        settings.distribution,
        device,
    )?;

    let merge_width = if context { d_value } else { 0 } + 2 * d_value + config.distance_width();

    Ok(ArgumentNet {
        lookup: config.lookup(device)?,
        embedder: config.embedder(embedding_size, true, true, device)?,
        entry: EntryStage::new(config, width, context, true, device),
        bottleneck,
        text_norm: None,
        towers,
        cross_attention: None,
        merge_attention: Some(merge_attention),
        merge: MergeStage::new(config, merge_width, final_size, res_size, true, device)?,
        heads: OutputHeads::new(
            final_size,
            config.outputs,
            config.partition()?,
            settings.classification,
            device,
        )?,
        layout: Ignored(config.layout(None, None)),
    })
}

impl<B: Backend> ArgumentNet<B> {
    pub fn signature(&self) -> &ModelSignature {
        &self.layout.0.signature
    }

    pub fn architecture(&self) -> &Architecture {
        &self.layout.0.architecture
    }

    pub fn embedder(&self) -> Option<&EmbedderBank<B>> {
        self.embedder.as_ref()
    }

    pub fn towers(&self) -> Option<&RecurrentTowers<B>> {
        self.towers.as_ref()
    }

    pub fn lookup(&self) -> Option<&FrozenLookup<B>> {
        self.lookup.as_ref()
    }

    /// Replaces the random lookup table with pre-trained rows. The table must
    /// match the configured vocabulary and embedding width.
    pub fn with_lookup(mut self, lookup: FrozenLookup<B>) -> Result<Self, ModelError> {
        let (vocab_size, dim) = match &self.lookup {
            Some(current) => (current.vocab_size(), current.dim()),
            None => return Err(ModelError::InvalidConfig(
                "network takes embedded inputs, not token ids".to_string(),
            )),
        };
        if lookup.vocab_size() != vocab_size {
            return Err(ModelError::WidthMismatch {
                component: "embedding table rows",
                expected: vocab_size,
                actual: lookup.vocab_size(),
            });
        }
        if lookup.dim() != dim {
            return Err(ModelError::WidthMismatch {
                component: "embedding table",
                expected: dim,
                actual: lookup.dim(),
            });
        }
        self.lookup = Some(lookup);
        Ok(self)
    }

    fn encode(
        &self,
        kind: StreamKind,
        input: StreamInput<B>,
    ) -> Result<Encoded<B>, ModelError> {
        let padding = input.padding();
        let features = match (input, &self.lookup) {
            (StreamInput::Tokens(ids), Some(lookup)) => lookup.forward(ids),
            (StreamInput::Tokens(_), None) => {
                return Err(ModelError::InputKind {
                    name: kind.name(),
                    expected: "embedded vectors",
                    actual: "token ids",
                })
            }
            (StreamInput::Embedded(x), _) => x,
        };
        let features = match &self.embedder {
            Some(bank) => bank.forward(kind, features)?,
            None => features,
        };
        Ok(Encoded {
            features: self.entry.forward(kind, features),
            padding,
        })
    }

    fn encode_batch(&self, batch: ArgumentBatch<B>) -> Result<EncodedBatch<B>, ModelError> {
        let text = match (self.layout.0.context, batch.text) {
            (true, Some(text)) => Some(self.encode(StreamKind::Text, text)?),
            (true, None) => return Err(ModelError::MissingInput("text")),
            (false, _) => None,
        };
        Ok(EncodedBatch {
            text,
            source: self.encode(StreamKind::Source, batch.source)?,
            target: self.encode(StreamKind::Target, batch.target)?,
            distance: batch.distance,
            mark: batch.mark,
        })
    }

    fn bottleneck(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.bottleneck {
            Some(linear) => relu(linear.forward(x)),
            None => x,
        }
    }

    fn with_mark(&self, text: Tensor<B, 3>, mark: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        match (self.layout.0.mark, mark) {
            (true, Some(mark)) => Tensor::cat(vec![text, mark], 2),
            _ => text,
        }
    }

    fn towers_or_err(&self) -> Result<&RecurrentTowers<B>, ModelError> {
        self.towers.as_ref().ok_or_else(|| {
            ModelError::InvalidConfig(format!(
                "{} was built without recurrent towers",
                self.layout.0.architecture.name()
            ))
        })
    }

    fn recurrent_vectors(&self, batch: EncodedBatch<B>) -> Result<Vec<Tensor<B, 2>>, ModelError> {
        let layout = &self.layout.0;
        let towers = self.towers_or_err()?;
        let pool = |x: Tensor<B, 3>, pooling: Option<Pooling>| match pooling {
            Some(pooling) => pooling.apply(x),
            None => x,
        };

        let mut vectors = Vec::with_capacity(4);
        if let (Some(text), Some(tower)) = (batch.text, towers.text()) {
            let text = self.with_mark(self.bottleneck(text.features), batch.mark);
            vectors.push(tower.forward_final(pool(text, layout.text_pooling)));
        }
        let source = pool(self.bottleneck(batch.source.features), layout.proposition_pooling);
        let target = pool(self.bottleneck(batch.target.features), layout.proposition_pooling);
        vectors.push(towers.source().forward_final(source));
        vectors.push(towers.target().forward_final(target));
        vectors.extend(batch.distance);
        Ok(vectors)
    }

    fn co_attention_vectors(&self, batch: EncodedBatch<B>) -> Result<Vec<Tensor<B, 2>>, ModelError> {
        let attention = self.cross_attention.as_ref().ok_or_else(|| {
            ModelError::InvalidConfig("cross attention block missing".to_string())
        })?;

        let mut vectors = Vec::with_capacity(4);
        if let Some(text) = batch.text {
            let features = self.with_mark(self.bottleneck(text.features), batch.mark);
            let vector = match self.towers.as_ref().and_then(|towers| towers.text()) {
                Some(tower) => tower.forward_final(features),
                None => {
                    let features = match &self.text_norm {
                        Some(norm) => norm.forward(features),
                        None => features,
                    };
                    masked_mean(features, text.padding)
                }
            };
            vectors.push(vector);
        }

        let source = self.bottleneck(batch.source.features);
        let target = self.bottleneck(batch.target.features);
        let (source, target) = match &self.towers {
            Some(towers) => {
                let (source_values, source_keys) = towers.source().forward_with_input(source);
                let (target_values, target_keys) = towers.target().forward_with_input(target);
                (
                    AttendedStream::new(source_keys, batch.source.padding).with_values(source_values),
                    AttendedStream::new(target_keys, batch.target.padding).with_values(target_values),
                )
            }
            None => (
                AttendedStream::new(source, batch.source.padding),
                AttendedStream::new(target, batch.target.padding),
            ),
        };

        let attended = attention.forward(source, target)?;
        vectors.push(attended.source);
        vectors.push(attended.target);
        vectors.extend(batch.distance);
        Ok(vectors)
    }

    fn scaled_attention_vectors(&self, batch: EncodedBatch<B>) -> Result<Vec<Tensor<B, 2>>, ModelError> {
        let merge = self.merge_attention.as_ref().ok_or_else(|| {
            ModelError::InvalidConfig("attention merge block missing".to_string())
        })?;
        let sequence = |x: Tensor<B, 3>, tower: Option<&BiLstmTower<B>>| {
            let x = self.bottleneck(x);
            match tower {
                Some(tower) => tower.forward_sequence(x),
                None => x,
            }
        };
        let towers = self.towers.as_ref();

        let text = batch.text.map(|text| {
            MaskedStream::new(
                sequence(text.features, towers.and_then(|t| t.text())),
                text.padding,
            )
        });
        let source = MaskedStream::new(
            sequence(batch.source.features, towers.map(|t| t.source())),
            batch.source.padding,
        );
        let target = MaskedStream::new(
            sequence(batch.target.features, towers.map(|t| t.target())),
            batch.target.padding,
        );

        let merged = merge.forward(text, source, target)?;
        let mut vectors = Vec::with_capacity(4);
        vectors.extend(merged.text);
        vectors.push(merged.source);
        vectors.push(merged.target);
        vectors.extend(batch.distance);
        Ok(vectors)
    }

    /// Validates `batch` against the signature and runs the network.
    pub fn forward(&self, batch: ArgumentBatch<B>) -> Result<ArgumentOutput<B>, ModelError> {
        self.layout.0.signature.validate(&batch)?;
        let encoded = self.encode_batch(batch)?;

        let vectors = match &self.layout.0.architecture {
            Architecture::Net7(_)
            | Architecture::Net7NonResidual(_)
            | Architecture::Net7NoContext(_) => self.recurrent_vectors(encoded)?,
            Architecture::Net8(_) => self.scaled_attention_vectors(encoded)?,
            Architecture::Net9(_) | Architecture::Net10(_) | Architecture::Net11(_) => {
                self.co_attention_vectors(encoded)?
            }
        };

        let x = self.merge.forward(vectors)?;
        self.heads.forward(x)
    }

    /// L2 term of every regularised dense and recurrent layer.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let device = self.merge.dense.weight.device();
        let weight = self.layout.0.l2_weight;
        let mut total = self.merge.l2_penalty(&device);
        if let Some(bank) = &self.embedder {
            total = total + bank.l2_penalty(&device);
        }
        if let Some(bottleneck) = &self.bottleneck {
            total = total + squared_norm(bottleneck, &device).mul_scalar(weight);
        }
        if let Some(towers) = &self.towers {
            total = total + towers.l2_penalty(&device);
        }
        total
    }

    pub fn param_stats(&self) -> ParameterStats {
        let embedder_params = self.embedder.as_ref().map_or(0, |m| m.num_params());
        let entry_params = self.entry.num_params()
            + self.text_norm.as_ref().map_or(0, |m| m.num_params());
        let sequence_params = self.bottleneck.as_ref().map_or(0, |m| m.num_params())
            + self.towers.as_ref().map_or(0, |m| m.num_params());
        let attention_params = self.cross_attention.as_ref().map_or(0, |m| m.num_params())
            + self.merge_attention.as_ref().map_or(0, |m| m.num_params());
        let merge_params = self.merge.num_params();
        let head_params = self.heads.num_params();
        let frozen_params = self.lookup.as_ref().map_or(0, |m| m.num_params());

        ParameterStats {
            total_params: embedder_params
                + entry_params
                + sequence_params
                + attention_params
                + merge_params
                + head_params,
            embedder_params,
            entry_params,
            sequence_params,
            attention_params,
            merge_params,
            head_params,
            frozen_params,
        }
    }

    pub fn print_summary(&self) {
        self.param_stats()
            .print_summary(self.layout.0.architecture.name());
    }
}
