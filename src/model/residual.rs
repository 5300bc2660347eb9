use burn::config::Config;
use burn::module::Module;
use burn::prelude::*;
use burn::tensor::backend::Backend;

use super::layers::{squared_norm, DenseUnit};
use crate::error::ModelError;

#[derive(Config, Debug)]
pub struct ResidualConfig {
    pub d_model: usize,

    #[config(default = 2)]
    pub blocks: usize,

    #[config(default = 2)]
    pub layers_per_block: usize,

    #[config(default = 50)]
    pub d_hidden: usize,

    #[config(default = 0.1)]
    pub dropout: f64,

    #[config(default = true)]
    pub batch_norm: bool,

    /// When false each block threads its output forward without the skip add.
    #[config(default = true)]
    pub residual: bool,

    #[config(default = 0.001)]
    pub l2_weight: f64,
}

impl ResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResidualTrunk<B>, ModelError> {
        if self.d_model == 0 {
            return Err(ModelError::ZeroWidth {
                component: "residual trunk",
                field: "d_model",
            });
        }
        if self.blocks > 0 && self.layers_per_block == 0 {
            return Err(ModelError::EmptyBlock {
                blocks: self.blocks,
            });
        }
        if self.blocks > 0 && self.layers_per_block > 1 && self.d_hidden == 0 {
            return Err(ModelError::ZeroWidth {
                component: "residual trunk",
                field: "d_hidden",
            });
        }

        let blocks = (0..self.blocks)
            .map(|_| {
                let mut units = Vec::with_capacity(self.layers_per_block);
                let mut d_in = self.d_model;
                for _ in 1..self.layers_per_block {
                    units.push(DenseUnit::new(
                        d_in,
                        self.d_hidden,
                        self.dropout,
                        self.batch_norm,
                        device,
                    ));
                    d_in = self.d_hidden;
                }
                units.push(DenseUnit::new(
                    d_in,
                    self.d_model,
                    self.dropout,
                    self.batch_norm,
                    device,
                ));
                ResidualBlock { units }
            })
            .collect();

        Ok(ResidualTrunk {
            blocks,
            residual: self.residual,
            l2_weight: self.l2_weight,
            d_model: self.d_model,
        })
    }
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    units: Vec<DenseUnit<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.units.iter().fold(x, |x, unit| unit.forward(x))
    }
}

/// Stack of blocks that always returns the width it was given.
///
/// With zero blocks the input is returned untouched.
#[derive(Module, Debug)]
pub struct ResidualTrunk<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    residual: bool,
    l2_weight: f64,
    d_model: usize,
}

impl<B: Backend> ResidualTrunk<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut block_input = x;
        for block in &self.blocks {
            let output = block.forward(block_input.clone());
            block_input = if self.residual {
                output + block_input
            } else {
                output
            };
        }
        block_input
    }

    /// Time-distributed application on `[batch, time, d_model]`.
    ///
    /// Batch norm statistics are shared across batch and time.
    pub fn forward_temporal(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, time, width] = x.dims();
        self.forward(x.reshape([batch * time, width]))
            .reshape([batch, time, width])
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        let dense_sum = self
            .blocks
            .iter()
            .flat_map(|block| block.units.iter())
            .map(|unit| squared_norm(unit.linear(), device))
            .fold(Tensor::zeros([1], device), |acc, term| acc + term);
        dense_sum.mul_scalar(self.l2_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_trunk_preserves_width() {
        let device = Default::default();
        let trunk = ResidualConfig::new(12)
            .with_blocks(3)
            .with_layers_per_block(2)
            .with_d_hidden(7)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 2>::random([5, 12], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(trunk.forward(x).dims(), [5, 12]);
        assert_eq!(trunk.num_blocks(), 3);
    }

    #[test]
    fn test_zero_blocks_is_identity() {
        let device = Default::default();
        let trunk = ResidualConfig::new(4)
            .with_blocks(0)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, -2.0, 3.0, 0.5]], &device);
        let y = trunk.forward(x.clone());
        x.into_data().assert_eq(&y.into_data(), true);

        let penalty: f32 = trunk.l2_penalty(&device).into_scalar();
        assert_eq!(penalty, 0.0);
    }

    #[test]
    fn test_single_layer_blocks_and_temporal_use() {
        let device = Default::default();
        let trunk = ResidualConfig::new(6)
            .with_blocks(2)
            .with_layers_per_block(1)
            .with_dropout(0.0)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 3>::random([2, 9, 6], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(trunk.forward_temporal(x).dims(), [2, 9, 6]);
    }

    #[test]
    fn test_blocks_without_layers_are_rejected() {
        let device = Default::default();
        let err = ResidualConfig::new(6)
            .with_blocks(1)
            .with_layers_per_block(0)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(err, ModelError::EmptyBlock { blocks: 1 });
    }

    #[test]
    fn test_non_residual_trunk_changes_values() {
        let device = Default::default();
        let trunk = ResidualConfig::new(3)
            .with_blocks(1)
            .with_residual(false)
            .with_batch_norm(false)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        assert_eq!(trunk.forward(x).dims(), [2, 3]);
        let penalty: f32 = trunk.l2_penalty(&device).into_scalar();
        assert!(penalty > 0.0);
    }
}
