use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::layers::{he_linear, squared_norm};
use super::masking::{masked_mean, mask_scores, mean_over_time, weighted_sum, Distribution};
use crate::error::ModelError;

/// How a stream is summarised before it is used as the query of the other stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryPooling {
    /// Plain time average, padding included.
    #[default]
    Mean,
    /// Average over non-padding timesteps only.
    MaskedMean,
}

#[derive(Config, Debug)]
pub struct CrossAttentionConfig {
    /// Width of the key-side features.
    pub d_features: usize,
    /// Width of the features that get weighted.
    pub d_value: usize,
    /// Width of the key space.
    pub d_key: usize,

    #[config(default = false)]
    pub shared_keys: bool,

    #[config(default = false)]
    pub shared_importance: bool,

    #[config(default = "QueryPooling::Mean")]
    pub pooling: QueryPooling,

    #[config(default = "Distribution::Softmax")]
    pub distribution: Distribution,
}

/// Coarse co-attention between the source and target propositions: each
/// stream's time-pooled summary becomes the additive-attention query of the
/// other stream.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    source_keys: Linear<B>,
    target_keys: Option<Linear<B>>,
    source_importance: Linear<B>,
    target_importance: Option<Linear<B>>,
    d_features: usize,
    d_value: usize,
    pooling: Ignored<QueryPooling>,
    distribution: Ignored<Distribution>,
}

/// One side of the attention: key-side features, the values that get
/// weighted, and the padding mask of the raw input.
#[derive(Debug, Clone)]
pub struct AttendedStream<B: Backend> {
    pub features: Tensor<B, 3>,
    pub values: Tensor<B, 3>,
    pub padding: Tensor<B, 2>,
}

impl<B: Backend> AttendedStream<B> {
    /// Keys and values are the same features.
    pub fn new(features: Tensor<B, 3>, padding: Tensor<B, 2>) -> Self {
        Self {
            values: features.clone(),
            features,
            padding,
        }
    }

    pub fn with_values(mut self, values: Tensor<B, 3>) -> Self {
        self.values = values;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CrossAttentionOutput<B: Backend> {
    pub source: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
    pub source_weights: Tensor<B, 2>,
    pub target_weights: Tensor<B, 2>,
}

impl CrossAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CrossAttention<B>, ModelError> {
        for (field, width) in [
            ("d_features", self.d_features),
            ("d_value", self.d_value),
            ("d_key", self.d_key),
        ] {
            if width == 0 {
                return Err(ModelError::ZeroWidth {
                    component: "cross attention",
                    field,
                });
            }
        }

        let keys = || LinearConfig::new(self.d_features, self.d_key).init(device);
        let importance = || he_linear(self.d_key, 1, device);

        Ok(CrossAttention {
            source_keys: keys(),
            target_keys: (!self.shared_keys).then(keys),
            source_importance: importance(),
            target_importance: (!self.shared_importance).then(importance),
            d_features: self.d_features,
            d_value: self.d_value,
            pooling: Ignored(self.pooling),
            distribution: Ignored(self.distribution),
        })
    }
}

impl<B: Backend> CrossAttention<B> {
    pub fn d_output(&self) -> usize {
        self.d_value
    }

    fn target_keys(&self) -> &Linear<B> {
        self.target_keys.as_ref().unwrap_or(&self.source_keys)
    }

    fn target_importance(&self) -> &Linear<B> {
        self.target_importance
            .as_ref()
            .unwrap_or(&self.source_importance)
    }

    fn pool(&self, stream: &AttendedStream<B>) -> Tensor<B, 2> {
        match self.pooling.0 {
            QueryPooling::Mean => mean_over_time(stream.features.clone()),
            QueryPooling::MaskedMean => {
                masked_mean(stream.features.clone(), stream.padding.clone())
            }
        }
    }

    fn check(&self, stream: &AttendedStream<B>) -> Result<(), ModelError> {
        let [batch, time, features] = stream.features.dims();
        if time == 0 {
            return Err(ModelError::EmptyStream {
                stream: "attention input",
            });
        }
        if features != self.d_features {
            return Err(ModelError::WidthMismatch {
                component: "cross attention features",
                expected: self.d_features,
                actual: features,
            });
        }
        let [v_batch, v_time, values] = stream.values.dims();
        if values != self.d_value {
            return Err(ModelError::WidthMismatch {
                component: "cross attention values",
                expected: self.d_value,
                actual: values,
            });
        }
        if v_batch != batch || v_time != time || stream.padding.dims() != [batch, time] {
            return Err(ModelError::InputShape {
                name: "attention stream",
                expected: vec![batch, time],
                actual: vec![v_batch, v_time],
            });
        }
        Ok(())
    }

    /// Additive attention weights of `stream` for a pooled `query`.
    fn weights(
        &self,
        stream: &AttendedStream<B>,
        keys: &Linear<B>,
        importance: &Linear<B>,
        query: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [batch, time, _] = stream.features.dims();
        let keyed = keys.forward(stream.features.clone());
        let query = keys.forward(query).unsqueeze_dim::<3>(1).repeat_dim(1, time);
        let scores = importance
            .forward(relu(keyed + query))
            .reshape([batch, time]);
        self.distribution
            .0
            .apply(mask_scores(scores, stream.padding.clone()))
    }

    pub fn forward(
        &self,
        source: AttendedStream<B>,
        target: AttendedStream<B>,
    ) -> Result<CrossAttentionOutput<B>, ModelError> {
        self.check(&source)?;
        self.check(&target)?;

        let source_summary = self.pool(&source);
        let target_summary = self.pool(&target);

        let source_weights =
            self.weights(&source, &self.source_keys, &self.source_importance, target_summary);
        let target_weights = self.weights(
            &target,
            self.target_keys(),
            self.target_importance(),
            source_summary,
        );

        Ok(CrossAttentionOutput {
            source: weighted_sum(source_weights.clone(), source.values),
            target: weighted_sum(target_weights.clone(), target.values),
            source_weights,
            target_weights,
        })
    }

    pub fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        squared_norm(self, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn padded_stream(device: &<TestBackend as Backend>::Device, width: usize) -> AttendedStream<TestBackend> {
        // Two examples of length 6, left padded by 2 and 4 steps.
        let mut padding = vec![0.0f32; 12];
        for t in 0..2 {
            padding[t] = 1.0;
        }
        for t in 0..4 {
            padding[6 + t] = 1.0;
        }
        let padding = Tensor::<TestBackend, 2>::from_data(
            burn::tensor::TensorData::new(padding, [2, 6]),
            device,
        );
        let features = Tensor::<TestBackend, 3>::random(
            [2, 6, width],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let keep = padding.clone().neg().add_scalar(1.0);
        let features = features * keep.reshape([2, 6, 1]).repeat_dim(2, width);
        AttendedStream::new(features, padding)
    }

    fn assert_masked_distribution(weights: Tensor<TestBackend, 2>, padding: Tensor<TestBackend, 2>) {
        let weights: Vec<f32> = weights.into_data().to_vec().unwrap();
        let padding: Vec<f32> = padding.into_data().to_vec().unwrap();
        for example in 0..2 {
            let mut total = 0.0;
            for t in 0..6 {
                let index = example * 6 + t;
                if padding[index] > 0.5 {
                    assert!(weights[index] < 1e-6);
                } else {
                    total += weights[index];
                }
            }
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_weights_sum_to_one_over_real_steps() {
        let device = Default::default();
        for distribution in [Distribution::Softmax, Distribution::Sparsemax] {
            let attention = CrossAttentionConfig::new(8, 8, 5)
                .with_distribution(distribution)
                .with_pooling(QueryPooling::MaskedMean)
                .init::<TestBackend>(&device)
                .unwrap();
            let source = padded_stream(&device, 8);
            let target = padded_stream(&device, 8);
            let (source_padding, target_padding) = (source.padding.clone(), target.padding.clone());

            let out = attention.forward(source, target).unwrap();
            assert_masked_distribution(out.source_weights, source_padding);
            assert_masked_distribution(out.target_weights, target_padding);
        }
    }

    #[test]
    fn test_context_width_follows_values() {
        let device = Default::default();
        let attention = CrossAttentionConfig::new(4, 9, 3)
            .with_shared_keys(true)
            .with_shared_importance(true)
            .init::<TestBackend>(&device)
            .unwrap();

        let source = padded_stream(&device, 4);
        let values = Tensor::<TestBackend, 3>::ones([2, 6, 9], &device);
        let source = source.with_values(values);
        let target = padded_stream(&device, 4)
            .with_values(Tensor::<TestBackend, 3>::ones([2, 6, 9], &device));

        let out = attention.forward(source, target).unwrap();
        assert_eq!(out.source.dims(), [2, 9]);
        assert_eq!(out.target.dims(), [2, 9]);
        // Weights sum to one, so averaging rows of ones gives ones.
        let values: Vec<f32> = out.source.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_value_width_mismatch_is_reported() {
        let device = Default::default();
        let attention = CrossAttentionConfig::new(4, 4, 3)
            .init::<TestBackend>(&device)
            .unwrap();
        let source = padded_stream(&device, 4)
            .with_values(Tensor::<TestBackend, 3>::ones([2, 6, 7], &device));
        let target = padded_stream(&device, 4);

        assert_eq!(
            attention.forward(source, target).unwrap_err(),
            ModelError::WidthMismatch {
                component: "cross attention values",
                expected: 4,
                actual: 7
            }
        );
    }
}
