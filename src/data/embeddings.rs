use burn::tensor::backend::Backend;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::error::{DataError, ModelError};
use crate::model::FrozenLookup;

/// Pre-trained word vectors indexed by token id, stored as a JSON array of
/// rows. Row 0 is the padding row.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    rows: Vec<f32>,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingTable {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, DataError> {
        let dim = rows.first().map_or(0, Vec::len);
        if rows.is_empty() || dim == 0 {
            return Err(DataError::Embeddings("table has no rows or zero width".to_string()));
        }
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != dim) {
            return Err(DataError::Embeddings(format!(
                "row {} has width {}, expected {}",
                index,
                row.len(),
                dim
            )));
        }

        let vocab_size = rows.len();
        Ok(Self {
            rows: rows.into_iter().flatten().collect(),
            vocab_size,
            dim,
        })
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let path = path.as_ref();
        let table = Self::from_reader(BufReader::new(File::open(path)?))?;
        info!(
            path = %path.display(),
            vocab_size = table.vocab_size,
            dim = table.dim,
            "loaded embedding table"
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DataError> {
        let rows: Vec<Vec<f32>> = serde_json::from_reader(reader)
            .map_err(|source| DataError::Json { line: 1, source })?;
        Self::from_rows(rows)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn lookup<B: Backend>(&self, device: &B::Device) -> Result<FrozenLookup<B>, ModelError> {
        FrozenLookup::from_rows(self.rows.clone(), self.vocab_size, self.dim, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Int, Tensor};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_reads_rows_into_lookup() {
        let table = EmbeddingTable::from_reader("[[0, 0], [1.5, -1], [2, 3]]".as_bytes()).unwrap();
        assert_eq!((table.vocab_size(), table.dim()), (3, 2));

        let device = Default::default();
        let lookup = table.lookup::<TestBackend>(&device).unwrap();
        let ids = Tensor::<TestBackend, 2, Int>::from_ints([[2, 1]], &device);
        let out: Vec<f32> = lookup.forward(ids).into_data().to_vec().unwrap();
        assert_eq!(out, vec![2.0, 3.0, 1.5, -1.0]);
    }

    #[test]
    fn test_rejects_ragged_and_empty_tables() {
        let err = EmbeddingTable::from_reader("[[0, 0], [1]]".as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::Embeddings(message) if message.contains("row 1")));
        assert!(matches!(
            EmbeddingTable::from_reader("[]".as_bytes()),
            Err(DataError::Embeddings(_))
        ));
        assert!(matches!(
            EmbeddingTable::from_reader("{\"rows\": 1}".as_bytes()),
            Err(DataError::Json { .. })
        ));
    }
}
