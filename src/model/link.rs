use burn::prelude::*;
use burn::tensor::backend::Backend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Assignment of every relation class to exactly one link class.
///
/// For the cdcp scheme `[[0, 2], [1, 3, 4]]` the first link class collects
/// relations 0 and 2 and the second collects the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPartition {
    groups: Vec<Vec<usize>>,
}

impl LabelPartition {
    pub fn new(
        groups: Vec<Vec<usize>>,
        relation_classes: usize,
        link_classes: usize,
    ) -> Result<Self, ModelError> {
        if groups.len() != link_classes {
            return Err(ModelError::PartitionGroupCount {
                groups: groups.len(),
                link_classes,
            });
        }

        let mut seen = vec![false; relation_classes];
        for (group_index, group) in groups.iter().enumerate() {
            if group.is_empty() {
                return Err(ModelError::PartitionEmptyGroup { group: group_index });
            }
            for &index in group {
                let slot = seen.get_mut(index).ok_or(ModelError::PartitionOutOfRange {
                    index,
                    classes: relation_classes,
                })?;
                if *slot {
                    return Err(ModelError::PartitionOverlap { index });
                }
                *slot = true;
            }
        }
        if let Some(index) = seen.iter().position(|assigned| !assigned) {
            return Err(ModelError::PartitionIncomplete { index });
        }

        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    pub fn link_classes(&self) -> usize {
        self.groups.len()
    }

    /// Relation classes that make up the first link class.
    pub fn positive_relations(&self) -> &[usize] {
        self.groups.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn aggregate<B: Backend>(&self, relation: Tensor<B, 2>) -> Tensor<B, 2> {
        aggregate_by_groups(relation, &self.groups)
    }
}

/// Column `g` of the result is the sum of the `relation` columns listed in
/// `groups[g]`. No renormalisation; indices past the relation width are
/// ignored.
pub fn aggregate_by_groups<B: Backend>(relation: Tensor<B, 2>, groups: &[Vec<usize>]) -> Tensor<B, 2> {
    let [_, relations] = relation.dims();
    let mut assignment = vec![0.0f32; relations * groups.len()];
    for (group, members) in groups.iter().enumerate() {
        for &index in members.iter().filter(|&&index| index < relations) {
            assignment[index * groups.len() + group] = 1.0;
        }
    }
    let assignment = Tensor::<B, 2>::from_data(
        TensorData::new(assignment, [relations, groups.len()]),
        &relation.device(),
    );
    relation.matmul(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn cdcp() -> LabelPartition {
        LabelPartition::new(vec![vec![0, 2], vec![1, 3, 4]], 5, 2).unwrap()
    }

    fn aggregate(values: [[f32; 5]; 1]) -> Vec<f32> {
        let device = Default::default();
        let relation = Tensor::<TestBackend, 2>::from_floats(values, &device);
        cdcp().aggregate(relation).into_data().to_vec().unwrap()
    }

    #[test]
    fn test_sums_assigned_columns() {
        let link = aggregate([[0.1, 0.2, 0.3, 0.25, 0.15]]);
        assert!((link[0] - 0.4).abs() < 1e-6);
        assert!((link[1] - 0.6).abs() < 1e-6);
        assert!((link.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_relation_distribution() {
        let link = aggregate([[0.2; 5]]);
        assert!((link[0] - 0.4).abs() < 1e-6);
        assert!((link[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_positive_relations_are_first_group() {
        assert_eq!(cdcp().positive_relations(), &[0, 2]);
    }

    #[test]
    fn test_raw_groups_without_members_give_zero_columns() {
        let device = Default::default();
        let relation = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.3, 0.2]], &device);
        let link: Vec<f32> = aggregate_by_groups(relation, &[vec![2, 0], vec![], vec![7]])
            .into_data()
            .to_vec()
            .unwrap();
        assert!((link[0] - 0.7).abs() < 1e-6);
        assert_eq!(&link[1..], &[0.0, 0.0]);
    }

    #[test]
    fn test_rejects_invalid_partitions() {
        assert_eq!(
            LabelPartition::new(vec![vec![0, 2], vec![1, 3]], 5, 2).unwrap_err(),
            ModelError::PartitionIncomplete { index: 4 }
        );
        assert_eq!(
            LabelPartition::new(vec![vec![0, 2], vec![2, 1, 3, 4]], 5, 2).unwrap_err(),
            ModelError::PartitionOverlap { index: 2 }
        );
        assert_eq!(
            LabelPartition::new(vec![vec![0, 5], vec![1, 2, 3, 4]], 5, 2).unwrap_err(),
            ModelError::PartitionOutOfRange { index: 5, classes: 5 }
        );
        assert_eq!(
            LabelPartition::new(vec![vec![0, 1, 2, 3, 4]], 5, 2).unwrap_err(),
            ModelError::PartitionGroupCount {
                groups: 1,
                link_classes: 2
            }
        );
        assert_eq!(
            LabelPartition::new(vec![vec![0, 1, 2, 3, 4], vec![]], 5, 2).unwrap_err(),
            ModelError::PartitionEmptyGroup { group: 1 }
        );
    }
}
