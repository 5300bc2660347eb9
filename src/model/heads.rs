use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::link::LabelPartition;
use super::masking::Distribution;
use super::signature::ArgumentOutput;
use crate::error::ModelError;

/// Class counts of the four classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputClasses {
    pub link: usize,
    pub relation: usize,
    pub source: usize,
    pub target: usize,
}

impl OutputClasses {
    pub fn new(link: usize, relation: usize, source: usize, target: usize) -> Self {
        Self {
            link,
            relation,
            source,
            target,
        }
    }

    pub fn as_array(&self) -> [usize; 4] {
        [self.link, self.relation, self.source, self.target]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (field, classes) in [
            ("link", self.link),
            ("relation", self.relation),
            ("source", self.source),
            ("target", self.target),
        ] {
            if classes == 0 {
                return Err(ModelError::ZeroWidth {
                    component: "output classes",
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Relation, link, source-type and target-type classifiers on the shared
/// representation. With a partition the link distribution is the grouped sum
/// of the relation distribution and has no parameters of its own.
#[derive(Module, Debug)]
pub struct OutputHeads<B: Backend> {
    relation: Linear<B>,
    link: Option<Linear<B>>,
    source: Linear<B>,
    target: Linear<B>,
    partition: Ignored<Option<LabelPartition>>,
    classification: Ignored<Distribution>,
}

impl<B: Backend> OutputHeads<B> {
    pub fn new(
        d_input: usize,
        classes: OutputClasses,
        partition: Option<LabelPartition>,
        classification: Distribution,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        classes.validate()?;
        if let Some(partition) = &partition {
            if partition.link_classes() != classes.link {
                return Err(ModelError::PartitionGroupCount {
                    groups: partition.link_classes(),
                    link_classes: classes.link,
                });
            }
        }

        let head = |classes: usize| LinearConfig::new(d_input, classes).init(device);
        Ok(Self {
            relation: head(classes.relation),
            link: partition.is_none().then(|| head(classes.link)),
            source: head(classes.source),
            target: head(classes.target),
            partition: Ignored(partition),
            classification: Ignored(classification),
        })
    }

    pub fn partition(&self) -> Option<&LabelPartition> {
        self.partition.0.as_ref()
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Result<ArgumentOutput<B>, ModelError> {
        let classify = self.classification.0;
        let relation = classify.apply(self.relation.forward(x.clone()));
        let link = match (&self.partition.0, &self.link) {
            (Some(partition), _) => partition.aggregate(relation.clone()),
            (None, Some(link)) => softmax(link.forward(x.clone()), 1),
            (None, None) => return Err(ModelError::MissingLinkHead),
        };

        Ok(ArgumentOutput {
            link,
            relation,
            source: classify.apply(self.source.forward(x.clone())),
            target: classify.apply(self.target.forward(x)),
        })
    }
}
