use burn::prelude::*;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::masking::{embedded_padding, token_padding};
use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Text,
    Source,
    Target,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Text => "text",
            StreamKind::Source => "source",
            StreamKind::Target => "target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputName {
    Text,
    Source,
    Target,
    Distance,
    Mark,
}

impl InputName {
    pub fn name(&self) -> &'static str {
        match self {
            InputName::Text => "text",
            InputName::Source => "source",
            InputName::Target => "target",
            InputName::Distance => "distance",
            InputName::Mark => "mark",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputName {
    Link,
    Relation,
    Source,
    Target,
}

impl OutputName {
    pub fn name(&self) -> &'static str {
        match self {
            OutputName::Link => "link",
            OutputName::Relation => "relation",
            OutputName::Source => "source",
            OutputName::Target => "target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Integer token ids, `0` is padding.
    Tokens,
    /// Pre-embedded float vectors, an all-zero row is padding.
    Embedded,
    /// Flat float features.
    Features,
}

impl InputKind {
    fn describe(&self) -> &'static str {
        match self {
            InputKind::Tokens => "token ids",
            InputKind::Embedded => "embedded vectors",
            InputKind::Features => "float features",
        }
    }
}

/// One named placeholder; `shape` excludes the batch dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: InputName,
    pub kind: InputKind,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: OutputName,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl ModelSignature {
    pub fn input(&self, name: InputName) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn input_names(&self) -> Vec<&'static str> {
        self.inputs.iter().map(|spec| spec.name.name()).collect()
    }

    pub fn output_names(&self) -> Vec<&'static str> {
        self.outputs.iter().map(|spec| spec.name.name()).collect()
    }

    pub fn output_widths(&self) -> Vec<usize> {
        self.outputs.iter().map(|spec| spec.width).collect()
    }

    /// Checks presence, kind and per-example shape of every input of `batch`,
    /// and that all inputs agree on the batch size.
    pub fn validate<B: Backend>(&self, batch: &ArgumentBatch<B>) -> Result<usize, ModelError> {
        let batch_size = batch.source.batch_size();

        let provided: [(InputName, Option<(InputKind, Vec<usize>)>); 5] = [
            (InputName::Text, batch.text.as_ref().map(|s| (s.kind(), s.dims()))),
            (InputName::Source, Some((batch.source.kind(), batch.source.dims()))),
            (InputName::Target, Some((batch.target.kind(), batch.target.dims()))),
            (
                InputName::Distance,
                batch
                    .distance
                    .as_ref()
                    .map(|t| (InputKind::Features, t.dims().to_vec())),
            ),
            (
                InputName::Mark,
                batch
                    .mark
                    .as_ref()
                    .map(|t| (InputKind::Features, t.dims().to_vec())),
            ),
        ];

        for (name, given) in provided {
            match (self.input(name), given) {
                (Some(_), None) => return Err(ModelError::MissingInput(name.name())),
                (None, Some(_)) => return Err(ModelError::UnexpectedInput(name.name())),
                (None, None) => {}
                (Some(spec), Some((kind, dims))) => {
                    if spec.kind != kind {
                        return Err(ModelError::InputKind {
                            name: name.name(),
                            expected: spec.kind.describe(),
                            actual: kind.describe(),
                        });
                    }
                    let mut expected = vec![batch_size];
                    expected.extend_from_slice(&spec.shape);
                    if dims != expected {
                        return Err(ModelError::InputShape {
                            name: name.name(),
                            expected,
                            actual: dims,
                        });
                    }
                }
            }
        }

        Ok(batch_size)
    }
}

impl fmt::Display for ModelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "inputs:")?;
        for spec in &self.inputs {
            writeln!(f, "  {:<10} {:?} {:?}", spec.name.name(), spec.kind, spec.shape)?;
        }
        writeln!(f, "outputs:")?;
        for spec in &self.outputs {
            writeln!(f, "  {:<10} {}", spec.name.name(), spec.width)?;
        }
        Ok(())
    }
}

/// A temporal input stream, either as token ids or as pre-embedded vectors.
#[derive(Debug, Clone)]
pub enum StreamInput<B: Backend> {
    Tokens(Tensor<B, 2, Int>),
    Embedded(Tensor<B, 3>),
}

impl<B: Backend> StreamInput<B> {
    pub fn kind(&self) -> InputKind {
        match self {
            StreamInput::Tokens(_) => InputKind::Tokens,
            StreamInput::Embedded(_) => InputKind::Embedded,
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            StreamInput::Tokens(t) => t.dims().to_vec(),
            StreamInput::Embedded(t) => t.dims().to_vec(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.dims()[0]
    }

    /// `[batch, time]` mask, `1.0` at padding positions of the raw input.
    pub fn padding(&self) -> Tensor<B, 2> {
        match self {
            StreamInput::Tokens(t) => token_padding(t.clone()),
            StreamInput::Embedded(t) => embedded_padding(t.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgumentBatch<B: Backend> {
    pub text: Option<StreamInput<B>>,
    pub source: StreamInput<B>,
    pub target: StreamInput<B>,
    pub distance: Option<Tensor<B, 2>>,
    pub mark: Option<Tensor<B, 3>>,
}

impl<B: Backend> ArgumentBatch<B> {
    pub fn new(source: StreamInput<B>, target: StreamInput<B>) -> Self {
        Self {
            text: None,
            source,
            target,
            distance: None,
            mark: None,
        }
    }

    pub fn with_text(mut self, text: StreamInput<B>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_distance(mut self, distance: Tensor<B, 2>) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn with_mark(mut self, mark: Tensor<B, 3>) -> Self {
        self.mark = Some(mark);
        self
    }
}

/// The four probability distributions produced for a batch of pairs.
#[derive(Debug, Clone)]
pub struct ArgumentOutput<B: Backend> {
    pub link: Tensor<B, 2>,
    pub relation: Tensor<B, 2>,
    pub source: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
}

impl<B: Backend> ArgumentOutput<B> {
    pub fn get(&self, name: OutputName) -> &Tensor<B, 2> {
        match name {
            OutputName::Link => &self.link,
            OutputName::Relation => &self.relation,
            OutputName::Source => &self.source,
            OutputName::Target => &self.target,
        }
    }
}
