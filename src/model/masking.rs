//! Padding detection and score normalisation shared by every attention block.
//!
//! Padding is always detected on the raw input of a stream (token id `0`, or an
//! all-zero embedding row) and expressed as a `[batch, time]` float mask that
//! is `1.0` at padding positions.

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

/// Score added to padding positions before normalisation.
pub const PADDING_PENALTY: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Softmax,
    Sparsemax,
}

impl Distribution {
    /// Normalise `scores` along dimension 1.
    pub fn apply<B: Backend>(self, scores: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Distribution::Softmax => softmax(scores, 1),
            Distribution::Sparsemax => sparsemax(scores),
        }
    }
}

pub fn token_padding<B: Backend>(ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
    ids.equal_elem(0).float()
}

pub fn embedded_padding<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, time, _] = x.dims();
    x.abs()
        .sum_dim(2)
        .equal_elem(0.0)
        .float()
        .reshape([batch, time])
}

pub fn mask_scores<B: Backend>(scores: Tensor<B, 2>, padding: Tensor<B, 2>) -> Tensor<B, 2> {
    scores + padding.mul_scalar(PADDING_PENALTY)
}

/// Sum over time of `features` divided by the number of non-padding steps.
///
/// Rows made only of padding are divided by one instead of zero.
pub fn masked_mean<B: Backend>(features: Tensor<B, 3>, padding: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, time, width] = features.dims();
    let keep = padding.neg().add_scalar(1.0);
    let counts = keep.clone().sum_dim(1).clamp_min(1.0);
    let weighted = features * keep.reshape([batch, time, 1]).repeat_dim(2, width);
    let summed: Tensor<B, 2> = weighted.sum_dim(1).reshape([batch, width]);
    summed / counts.repeat_dim(1, width)
}

pub fn mean_over_time<B: Backend>(features: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, _, width] = features.dims();
    features.mean_dim(1).reshape([batch, width])
}

/// Weighted sum over time: `weights` is `[batch, time]`, `values` is
/// `[batch, time, width]`.
pub fn weighted_sum<B: Backend>(weights: Tensor<B, 2>, values: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, time, width] = values.dims();
    let weights = weights.reshape([batch, time, 1]).repeat_dim(2, width);
    (values * weights).sum_dim(1).reshape([batch, width])
}

/// Sparsemax along dimension 1 (Martins & Astudillo, 2016).
///
/// Projects each row onto the probability simplex; low scores receive exactly
/// zero weight.
pub fn sparsemax<B: Backend>(z: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, n] = z.dims();
    let device = z.device();

    let sorted = z.clone().sort_descending(1);

    let mut upper = vec![0.0f32; n * n];
    for row in 0..n {
        for col in row..n {
            upper[row * n + col] = 1.0;
        }
    }
    let upper = Tensor::<B, 2>::from_data(TensorData::new(upper, [n, n]), &device);
    let cumulative = sorted.clone().matmul(upper);

    let ranks = Tensor::<B, 1, Int>::arange(1..(n as i64 + 1), &device)
        .float()
        .reshape([1, n])
        .repeat_dim(0, batch);
    let support = (sorted.clone() * ranks)
        .add_scalar(1.0)
        .greater(cumulative)
        .float();

    let support_size = support.clone().sum_dim(1);
    let support_sum = (sorted * support).sum_dim(1);
    let threshold = (support_sum.sub_scalar(1.0) / support_size).repeat_dim(1, n);

    (z - threshold).clamp_min(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn row(t: Tensor<TestBackend, 2>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_token_and_embedded_padding() {
        let device = Default::default();
        let ids = Tensor::<TestBackend, 2, Int>::from_ints([[0, 0, 4, 7]], &device);
        assert_eq!(row(token_padding(ids)), vec![1.0, 1.0, 0.0, 0.0]);

        let x = Tensor::<TestBackend, 3>::from_floats(
            [[[0.0, 0.0], [0.5, -0.5], [0.0, 0.0]]],
            &device,
        );
        assert_eq!(row(embedded_padding(x)), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_masked_softmax_ignores_padding() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 2>::from_floats([[3.0, 1.0, 2.0, 5.0]], &device);
        let padding = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0, 1.0, 1.0]], &device);

        let weights = row(Distribution::Softmax.apply(mask_scores(scores, padding)));
        assert!((weights[0] + weights[1] - 1.0).abs() < 1e-5);
        assert!(weights[2] < 1e-6);
        assert!(weights[3] < 1e-6);
    }

    #[test]
    fn test_sparsemax_is_sparse_distribution() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 2>::from_floats(
            [[2.0, 1.0, -1.0, 0.1], [0.3, 0.3, 0.3, 0.3]],
            &device,
        );

        let out = row(sparsemax(scores));
        let first = &out[0..4];
        assert!((first.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((first[0] - 1.0).abs() < 1e-5);
        assert_eq!(first[2], 0.0);

        let uniform = &out[4..8];
        for value in uniform {
            assert!((value - 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sparsemax_with_padding_penalty() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.4, 0.9]], &device);
        let padding = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0, 1.0]], &device);

        let out = row(sparsemax(mask_scores(scores, padding)));
        assert!((out[0] + out[1] - 1.0).abs() < 1e-5);
        assert_eq!(out[2], 0.0);
        assert!((out[0] - 0.55).abs() < 1e-5);
    }

    #[test]
    fn test_masked_mean_divides_by_real_steps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::from_floats(
            [[[0.0, 0.0], [2.0, 4.0], [4.0, 8.0]]],
            &device,
        );
        let padding = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0, 0.0]], &device);

        assert_eq!(row(masked_mean(x.clone(), padding)), vec![3.0, 6.0]);
        assert_eq!(row(mean_over_time(x)), vec![2.0, 4.0]);
    }
}
