use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::layers::{he_linear, squared_norm};
use super::masking::{mask_scores, masked_mean, weighted_sum, Distribution};
use crate::error::ModelError;

/// How the scaled-attention network turns each stream into a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMerge {
    /// One scoring network per stream.
    #[default]
    SelfAttention,
    /// One scoring network for all streams.
    SharedSelfAttention,
    /// Each stream is scored together with the masked means of the others.
    CoarseCoAttention,
}

/// Time-distributed `Dense(relu) -> Dense(1)` producing one score per step.
#[derive(Module, Debug)]
pub struct AttentionScorer<B: Backend> {
    mlp: Linear<B>,
    importance: Linear<B>,
}

impl<B: Backend> AttentionScorer<B> {
    pub fn new(d_input: usize, d_space: usize, device: &B::Device) -> Self {
        Self {
            mlp: he_linear(d_input, d_space, device),
            importance: LinearConfig::new(d_space, 1).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, time, _] = x.dims();
        self.importance
            .forward(relu(self.mlp.forward(x)))
            .reshape([batch, time])
    }
}

/// A temporal stream and the padding mask of its raw input.
#[derive(Debug, Clone)]
pub struct MaskedStream<B: Backend> {
    pub features: Tensor<B, 3>,
    pub padding: Tensor<B, 2>,
}

impl<B: Backend> MaskedStream<B> {
    pub fn new(features: Tensor<B, 3>, padding: Tensor<B, 2>) -> Self {
        Self { features, padding }
    }
}

#[derive(Debug, Clone)]
pub struct MergedStreams<B: Backend> {
    pub text: Option<Tensor<B, 2>>,
    pub source: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
    pub source_weights: Tensor<B, 2>,
    pub target_weights: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct AttentionMergeBlock<B: Backend> {
    text: Option<AttentionScorer<B>>,
    source: AttentionScorer<B>,
    target: Option<AttentionScorer<B>>,
    with_text: bool,
    d_value: usize,
    mode: Ignored<AttentionMerge>,
    distribution: Ignored<Distribution>,
}

impl<B: Backend> AttentionMergeBlock<B> {
    pub fn new(
        mode: AttentionMerge,
        d_value: usize,
        d_space: usize,
        with_text: bool,
        distribution: Distribution,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        if d_value == 0 || d_space == 0 {
            return Err(ModelError::ZeroWidth {
                component: "attention merge",
                field: if d_value == 0 { "d_value" } else { "d_space" },
            });
        }

        let context_width = if with_text { d_value } else { 0 };
        let (text, source, target) = match mode {
            AttentionMerge::SelfAttention => (
                with_text.then(|| AttentionScorer::new(d_value, d_space, device)),
                AttentionScorer::new(d_value, d_space, device),
                Some(AttentionScorer::new(d_value, d_space, device)),
            ),
            AttentionMerge::SharedSelfAttention => {
                (None, AttentionScorer::new(d_value, d_space, device), None)
            }
            AttentionMerge::CoarseCoAttention => (
                with_text.then(|| AttentionScorer::new(3 * d_value, d_space, device)),
                AttentionScorer::new(2 * d_value + context_width, d_space, device),
                Some(AttentionScorer::new(
                    2 * d_value + context_width,
                    d_space,
                    device,
                )),
            ),
        };

        Ok(Self {
            text,
            source,
            target,
            with_text,
            d_value,
            mode: Ignored(mode),
            distribution: Ignored(distribution),
        })
    }

    pub fn d_output(&self) -> usize {
        self.d_value
    }

    fn text_scorer(&self) -> &AttentionScorer<B> {
        self.text.as_ref().unwrap_or(&self.source)
    }

    fn target_scorer(&self) -> &AttentionScorer<B> {
        self.target.as_ref().unwrap_or(&self.source)
    }

    fn attend(&self, scorer: &AttentionScorer<B>, input: Tensor<B, 3>, stream: &MaskedStream<B>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let scores = mask_scores(scorer.forward(input), stream.padding.clone());
        let weights = self.distribution.0.apply(scores);
        (
            weighted_sum(weights.clone(), stream.features.clone()),
            weights,
        )
    }

    fn with_queries(stream: &MaskedStream<B>, queries: &[&Tensor<B, 2>]) -> Tensor<B, 3> {
        let [_, time, _] = stream.features.dims();
        let mut parts = vec![stream.features.clone()];
        parts.extend(
            queries
                .iter()
                .map(|query| (*query).clone().unsqueeze_dim::<3>(1).repeat_dim(1, time)),
        );
        Tensor::cat(parts, 2)
    }

    pub fn forward(
        &self,
        text: Option<MaskedStream<B>>,
        source: MaskedStream<B>,
        target: MaskedStream<B>,
    ) -> Result<MergedStreams<B>, ModelError> {
        let text = match (self.with_text, text) {
            (true, None) => return Err(ModelError::MissingInput("text")),
            (false, _) => None,
            (true, text) => text,
        };
        for stream in text.iter().chain([&source, &target]) {
            let width = stream.features.dims()[2];
            if width != self.d_value {
                return Err(ModelError::WidthMismatch {
                    component: "attention merge",
                    expected: self.d_value,
                    actual: width,
                });
            }
        }

        let (text_vector, (source_vector, source_weights), (target_vector, target_weights)) =
            match self.mode.0 {
                AttentionMerge::SelfAttention | AttentionMerge::SharedSelfAttention => (
                    text.as_ref().map(|stream| {
                        self.attend(self.text_scorer(), stream.features.clone(), stream).0
                    }),
                    self.attend(&self.source, source.features.clone(), &source),
                    self.attend(self.target_scorer(), target.features.clone(), &target),
                ),
                AttentionMerge::CoarseCoAttention => {
                    let source_mean = masked_mean(source.features.clone(), source.padding.clone());
                    let target_mean = masked_mean(target.features.clone(), target.padding.clone());
                    let text_mean = text
                        .as_ref()
                        .map(|stream| masked_mean(stream.features.clone(), stream.padding.clone()));

                    let (source_input, target_input) = match &text_mean {
                        Some(text_mean) => (
                            Self::with_queries(&source, &[text_mean, &target_mean]),
                            Self::with_queries(&target, &[text_mean, &source_mean]),
                        ),
                        None => (
                            Self::with_queries(&source, &[&target_mean]),
                            Self::with_queries(&target, &[&source_mean]),
                        ),
                    };
                    let text_vector = text.as_ref().map(|stream| {
                        let input = Self::with_queries(stream, &[&target_mean, &source_mean]);
                        self.attend(self.text_scorer(), input, stream).0
                    });

                    (
                        text_vector,
                        self.attend(&self.source, source_input, &source),
                        self.attend(self.target_scorer(), target_input, &target),
                    )
                }
            };

        Ok(MergedStreams {
            text: text_vector,
            source: source_vector,
            target: target_vector,
            source_weights,
            target_weights,
        })
    }

    pub fn squared_weights(&self, device: &B::Device) -> Tensor<B, 1> {
        squared_norm(self, device)
    }
}
