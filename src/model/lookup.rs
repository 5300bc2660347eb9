use burn::module::{Module, Param};
use burn::prelude::*;
use burn::tensor::backend::Backend;
use burn::tensor::module::embedding;
use burn::tensor::TensorData;

use crate::error::ModelError;

/// Pre-trained embedding table for bag-of-words inputs. Row 0 is the padding
/// row; the table never receives gradient updates.
#[derive(Module, Debug)]
pub struct FrozenLookup<B: Backend> {
    table: Param<Tensor<B, 2>>,
    vocab_size: usize,
    dim: usize,
}

impl<B: Backend> FrozenLookup<B> {
    pub fn from_rows(
        rows: Vec<f32>,
        vocab_size: usize,
        dim: usize,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        if vocab_size == 0 || dim == 0 {
            return Err(ModelError::ZeroWidth {
                component: "embedding table",
                field: if vocab_size == 0 { "vocab_size" } else { "dim" },
            });
        }
        if rows.len() != vocab_size * dim {
            return Err(ModelError::WidthMismatch {
                component: "embedding table",
                expected: vocab_size * dim,
                actual: rows.len(),
            });
        }

        let table = Tensor::<B, 2>::from_data(TensorData::new(rows, [vocab_size, dim]), device);
        Ok(Self {
            table: Param::from_tensor(table).set_require_grad(false),
            vocab_size,
            dim,
        })
    }

    /// Random table with a zero padding row, used when no pre-trained
    /// vectors are supplied.
    pub fn random(vocab_size: usize, dim: usize, device: &B::Device) -> Result<Self, ModelError> {
        let rows = Tensor::<B, 2>::random(
            [vocab_size, dim],
            burn::tensor::Distribution::Normal(0.0, 0.1),
            device,
        );
        let mut rows: Vec<f32> = rows.into_data().iter::<f32>().collect();
        for value in rows.iter_mut().take(dim) {
            *value = 0.0;
        }
        Self::from_rows(rows, vocab_size, dim, device)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// `[batch, time]` ids to `[batch, time, dim]` vectors.
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        embedding(self.table.val(), ids)
    }
}
