use burn::prelude::*;
use burn::tensor::backend::Backend;
use burn::tensor::TensorData;

use super::dataset::{PairRecord, Sequence};
use super::distance::encode_distance;
use crate::error::DataError;
use crate::model::config::NetworkConfig;
use crate::model::heads::OutputClasses;
use crate::model::signature::{ArgumentBatch, StreamInput};

/// One-hot targets of the four heads.
#[derive(Debug, Clone)]
pub struct PairTargets<B: Backend> {
    pub link: Tensor<B, 2>,
    pub relation: Tensor<B, 2>,
    pub source: Tensor<B, 2>,
    pub target: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct PairBatch<B: Backend> {
    pub inputs: ArgumentBatch<B>,
    pub targets: PairTargets<B>,
}

/// Turns pair records into network inputs shaped after a [`NetworkConfig`].
///
/// Sequences are left padded to the configured lengths; longer sequences keep
/// their last steps.
#[derive(Debug, Clone)]
pub struct PairBatcher {
    pub text_length: usize,
    pub proposition_length: usize,
    pub embedding_dim: usize,
    pub tokens: bool,
    pub text: bool,
    pub context: bool,
    pub mark: bool,
    pub distance: usize,
    pub classes: OutputClasses,
}

enum Padded {
    Tokens(Vec<i64>),
    Embedded(Vec<f32>),
}

impl PairBatcher {
    pub fn new(config: &NetworkConfig) -> Self {
        PairBatcher {
            text_length: config.text_length,
            proposition_length: config.proposition_length,
            embedding_dim: config.embedding_dim,
            tokens: config.vocab_size.is_some(),
            text: config.architecture.has_text_input(),
            context: config.uses_context(),
            mark: config.uses_mark(),
            distance: config.distance,
            classes: config.outputs,
        }
    }

    fn pad_sequence(
        &self,
        record: usize,
        sequence: Option<&Sequence>,
        length: usize,
    ) -> Result<Padded, DataError> {
        let mismatch = |message: String| DataError::Record { record, message };
        match (self.tokens, sequence) {
            (true, None) => Ok(Padded::Tokens(vec![0; length])),
            (false, None) => Ok(Padded::Embedded(vec![0.0; length * self.embedding_dim])),
            (true, Some(Sequence::Tokens(ids))) => {
                let kept = &ids[ids.len().saturating_sub(length)..];
                let mut out = vec![0i64; length - kept.len()];
                out.extend(kept.iter().map(|&id| id as i64));
                Ok(Padded::Tokens(out))
            }
            (false, Some(Sequence::Embedded(rows))) => {
                let kept = &rows[rows.len().saturating_sub(length)..];
                let mut out = vec![0.0f32; (length - kept.len()) * self.embedding_dim];
                for row in kept {
                    if row.len() != self.embedding_dim {
                        return Err(mismatch(format!(
                            "embedding width {} but the network expects {}",
                            row.len(),
                            self.embedding_dim
                        )));
                    }
                    out.extend_from_slice(row);
                }
                Ok(Padded::Embedded(out))
            }
            (true, Some(Sequence::Embedded(_))) => Err(mismatch(
                "embedded sequence given to a token-id network".to_string(),
            )),
            (false, Some(Sequence::Tokens(_))) => Err(mismatch(
                "token ids given to a network without a vocabulary".to_string(),
            )),
        }
    }

    fn one_hot(&self, record: usize, class: usize, classes: usize, head: &str) -> Result<Vec<f32>, DataError> {
        if class >= classes {
            return Err(DataError::Record {
                record,
                message: format!("{} class {} outside 0..{}", head, class, classes),
            });
        }
        let mut row = vec![0.0; classes];
        row[class] = 1.0;
        Ok(row)
    }

    fn stream<B: Backend>(
        &self,
        parts: Vec<Padded>,
        length: usize,
        device: &B::Device,
    ) -> StreamInput<B> {
        let batch = parts.len();
        if self.tokens {
            let flat: Vec<i64> = parts
                .into_iter()
                .flat_map(|part| match part {
                    Padded::Tokens(ids) => ids,
                    Padded::Embedded(_) => Vec::new(),
                })
                .collect();
            StreamInput::Tokens(Tensor::from_data(
                TensorData::new(flat, [batch, length]),
                device,
            ))
        } else {
            let flat: Vec<f32> = parts
                .into_iter()
                .flat_map(|part| match part {
                    Padded::Embedded(values) => values,
                    Padded::Tokens(_) => Vec::new(),
                })
                .collect();
            StreamInput::Embedded(Tensor::from_data(
                TensorData::new(flat, [batch, length, self.embedding_dim]),
                device,
            ))
        }
    }

    pub fn batch<B: Backend>(
        &self,
        records: &[&PairRecord],
        device: &B::Device,
    ) -> Result<PairBatch<B>, DataError> {
        let n = records.len();
        let mut sources = Vec::with_capacity(n);
        let mut targets = Vec::with_capacity(n);
        let mut texts = Vec::with_capacity(n);
        let mut marks = Vec::with_capacity(n * self.text_length * 2);
        let mut distances = Vec::with_capacity(n * 2 * self.distance);
        let mut link = Vec::with_capacity(n * self.classes.link);
        let mut relation = Vec::with_capacity(n * self.classes.relation);
        let mut source_type = Vec::with_capacity(n * self.classes.source);
        let mut target_type = Vec::with_capacity(n * self.classes.target);

        for (index, record) in records.iter().enumerate() {
            sources.push(self.pad_sequence(index, Some(&record.source), self.proposition_length)?);
            targets.push(self.pad_sequence(index, Some(&record.target), self.proposition_length)?);

            if self.text {
                if self.context && record.text.is_none() {
                    return Err(DataError::Record {
                        record: index,
                        message: "missing text for a network that reads context".to_string(),
                    });
                }
                let text = if self.context { record.text.as_ref() } else { None };
                texts.push(self.pad_sequence(index, text, self.text_length)?);
            }

            if self.mark {
                let steps = record.mark.as_deref().unwrap_or(&[]);
                let kept = &steps[steps.len().saturating_sub(self.text_length)..];
                marks.extend(std::iter::repeat(0.0).take(2 * (self.text_length - kept.len())));
                marks.extend(kept.iter().flatten());
            }

            distances.extend(encode_distance(record.difference, self.distance));
            link.extend(self.one_hot(index, record.link_class(), self.classes.link, "link")?);
            relation.extend(self.one_hot(index, record.relation, self.classes.relation, "relation")?);
            source_type.extend(self.one_hot(index, record.source_type, self.classes.source, "source")?);
            target_type.extend(self.one_hot(index, record.target_type, self.classes.target, "target")?);
        }

        let mut inputs = ArgumentBatch::new(
            self.stream(sources, self.proposition_length, device),
            self.stream(targets, self.proposition_length, device),
        );
        if self.text {
            inputs = inputs.with_text(self.stream(texts, self.text_length, device));
        }
        if self.distance > 0 {
            inputs = inputs.with_distance(Tensor::from_data(
                TensorData::new(distances, [n, 2 * self.distance]),
                device,
            ));
        }
        if self.mark {
            inputs = inputs.with_mark(Tensor::from_data(
                TensorData::new(marks, [n, self.text_length, 2]),
                device,
            ));
        }

        let matrix = |values: Vec<f32>, width: usize| {
            Tensor::<B, 2>::from_data(TensorData::new(values, [n, width]), device)
        };
        Ok(PairBatch {
            inputs,
            targets: PairTargets {
                link: matrix(link, self.classes.link),
                relation: matrix(relation, self.classes.relation),
                source: matrix(source_type, self.classes.source),
                target: matrix(target_type, self.classes.target),
            },
        })
    }
}
