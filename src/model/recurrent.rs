use burn::module::{Ignored, Module};
use burn::nn::{BiLstm, BiLstmConfig, Dropout, DropoutConfig};
use burn::prelude::*;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::layers::{squared_norm, StreamNorm};

/// How the forward and backward halves of a bidirectional LSTM are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Element-wise product, output width = hidden width.
    Mul,
    /// Concatenation, output width = twice the hidden width.
    Concat,
}

/// Optional input norm followed by a bidirectional LSTM.
///
/// Dropout is applied to the LSTM input only. burn's `BiLstm` runs the whole
/// sequence in one call and exposes no per-step hook, so there is no
/// recurrent dropout on the hidden state between steps.
#[derive(Module, Debug)]
pub struct BiLstmTower<B: Backend> {
    norm: Option<StreamNorm<B>>,
    dropout: Dropout,
    lstm: BiLstm<B>,
    d_hidden: usize,
    merge: Ignored<MergeMode>,
}

impl<B: Backend> BiLstmTower<B> {
    pub fn new(
        d_input: usize,
        d_hidden: usize,
        merge: MergeMode,
        norm: Option<StreamNorm<B>>,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            norm,
            dropout: DropoutConfig::new(dropout).init(),
            lstm: BiLstmConfig::new(d_input, d_hidden, true).init(device),
            d_hidden,
            merge: Ignored(merge),
        }
    }

    pub fn d_output(&self) -> usize {
        match self.merge.0 {
            MergeMode::Mul => self.d_hidden,
            MergeMode::Concat => 2 * self.d_hidden,
        }
    }

    fn run(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let (output, _) = self.lstm.forward(self.dropout.forward(x), None);
        output
    }

    fn merge(&self, forward: Tensor<B, 3>, backward: Tensor<B, 3>) -> Tensor<B, 3> {
        match self.merge.0 {
            MergeMode::Mul => forward * backward,
            MergeMode::Concat => Tensor::cat(vec![forward, backward], 2),
        }
    }

    /// Normalised input and full output sequence `[batch, time, d_output]`.
    pub fn forward_with_input(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let normed = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let (output, _) = self.lstm.forward(self.dropout.forward(normed.clone()), None);
        let h = self.d_hidden;
        let forward = output.clone().narrow(2, 0, h);
        let backward = output.narrow(2, h, h);
        (normed, self.merge(forward, backward))
    }

    pub fn forward_sequence(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.forward_with_input(x).1
    }

    /// Last state of each direction: the forward pass at the final timestep and
    /// the backward pass at the first one, merged to `[batch, d_output]`.
    pub fn forward_final(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let output = self.run(x);
        let [batch, time, _] = output.dims();
        let h = self.d_hidden;
        let forward = output.clone().slice([0..batch, time - 1..time, 0..h]);
        let backward = output.slice([0..batch, 0..1, h..2 * h]);
        let width = self.d_output();
        self.merge(forward, backward).reshape([batch, width])
    }

    pub fn squared_weights(&self, device: &B::Device) -> Tensor<B, 1> {
        squared_norm(&self.lstm, device)
    }
}

/// Towers for the three streams. With a single proposition tower the target
/// stream runs through the source tower; the text stream always has its own.
#[derive(Module, Debug)]
pub struct RecurrentTowers<B: Backend> {
    text: Option<BiLstmTower<B>>,
    source: BiLstmTower<B>,
    target: Option<BiLstmTower<B>>,
    l2_weight: f64,
}

impl<B: Backend> RecurrentTowers<B> {
    pub fn new(
        text: Option<BiLstmTower<B>>,
        source: BiLstmTower<B>,
        target: Option<BiLstmTower<B>>,
        l2_weight: f64,
    ) -> Self {
        Self {
            text,
            source,
            target,
            l2_weight,
        }
    }

    pub fn text(&self) -> Option<&BiLstmTower<B>> {
        self.text.as_ref()
    }

    pub fn source(&self) -> &BiLstmTower<B> {
        &self.source
    }

    pub fn target(&self) -> &BiLstmTower<B> {
        self.target.as_ref().unwrap_or(&self.source)
    }

    pub fn is_single(&self) -> bool {
        self.target.is_none()
    }

    pub fn l2_penalty(&self, device: &B::Device) -> Tensor<B, 1> {
        let mut total = self.source.squared_weights(device);
        if let Some(tower) = &self.target {
            total = total + tower.squared_weights(device);
        }
        if let Some(tower) = &self.text {
            total = total + tower.squared_weights(device);
        }
        total.mul_scalar(self.l2_weight)
    }
}
