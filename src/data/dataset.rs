use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

use super::embeddings::EmbeddingTable;
use crate::error::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

/// A proposition or document as token ids (0 is padding) or as one
/// pre-computed vector per token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sequence {
    Tokens(Vec<u32>),
    Embedded(Vec<Vec<f32>>),
}

impl Sequence {
    pub fn len(&self) -> usize {
        match self {
            Sequence::Tokens(ids) => ids.len(),
            Sequence::Embedded(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tokens(&self) -> bool {
        matches!(self, Sequence::Tokens(_))
    }
}

/// One ordered (source, target) proposition pair, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub split: Split,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub text_id: Option<String>,
    pub source: Sequence,
    pub target: Sequence,
    #[serde(default)]
    pub text: Option<Sequence>,
    /// Per text token: `[inside source, inside target]`.
    #[serde(default)]
    pub mark: Option<Vec<[f32; 2]>>,
    /// Position of the target minus position of the source.
    pub difference: i64,
    pub link: bool,
    pub relation: usize,
    pub source_type: usize,
    pub target_type: usize,
}

impl PairRecord {
    pub fn is_reflexive(&self) -> bool {
        self.source_id == self.target_id
    }

    /// Index of the link class; class 0 is "linked".
    pub fn link_class(&self) -> usize {
        if self.link {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairDataset {
    records: Vec<PairRecord>,
    embeddings: Option<EmbeddingTable>,
}

impl PairDataset {
    pub fn new(records: Vec<PairRecord>) -> Self {
        Self {
            records,
            embeddings: None,
        }
    }

    /// Reads a JSON Lines file. Training pairs farther apart than
    /// `distance_train_limit` are dropped.
    pub fn from_jsonl<P: AsRef<Path>>(
        path: P,
        distance_train_limit: Option<usize>,
    ) -> Result<Self, DataError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading pair dataset");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), distance_train_limit)
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        distance_train_limit: Option<usize>,
    ) -> Result<Self, DataError> {
        let mut records = Vec::new();
        let mut dropped = 0usize;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PairRecord =
                serde_json::from_str(&line).map_err(|source| DataError::Json {
                    line: index + 1,
                    source,
                })?;

            let too_far = distance_train_limit
                .map(|limit| record.difference.unsigned_abs() > limit as u64)
                .unwrap_or(false);
            if record.split == Split::Train && too_far {
                dropped += 1;
                continue;
            }
            records.push(record);
        }

        debug!(records = records.len(), dropped, "parsed pair records");
        Ok(Self {
            records,
            embeddings: None,
        })
    }

    /// Word vectors for token-id records.
    pub fn with_embeddings(mut self, table: EmbeddingTable) -> Self {
        self.embeddings = Some(table);
        self
    }

    pub fn embeddings(&self) -> Option<&EmbeddingTable> {
        self.embeddings.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PairRecord] {
        &self.records
    }

    pub fn split(&self, split: Split) -> Vec<&PairRecord> {
        self.records.iter().filter(|r| r.split == split).collect()
    }

    /// Records of `split`, or an error when it has none.
    pub fn require_split(&self, split: Split) -> Result<Vec<&PairRecord>, DataError> {
        let records = self.split(split);
        if records.is_empty() {
            Err(DataError::EmptySplit(split.name().to_string()))
        } else {
            Ok(records)
        }
    }

    /// Longest text and longest proposition in the dataset.
    pub fn longest(&self) -> (usize, usize) {
        self.records.iter().fold((0, 0), |(text, prop), r| {
            (
                text.max(r.text.as_ref().map_or(0, Sequence::len)),
                prop.max(r.source.len()).max(r.target.len()),
            )
        })
    }
}

/// Walks a split in mini-batches, reshuffling at every epoch.
pub struct PairLoader {
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl PairLoader {
    pub fn new(len: usize, batch_size: usize, shuffle: bool) -> Self {
        PairLoader {
            indices: (0..len).collect(),
            batch_size: batch_size.max(1),
            shuffle,
        }
    }

    /// Index chunks of one epoch; the last chunk may be short.
    pub fn epoch(&mut self) -> Vec<Vec<usize>> {
        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
        self.indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINES: &str = r#"
{"split":"train","source_id":"a","target_id":"b","source":[3,4],"target":[5],"text":[3,4,5],"mark":[[1,0],[1,0],[0,1]],"difference":1,"link":true,"relation":0,"source_type":1,"target_type":2}
{"split":"train","source_id":"a","target_id":"c","source":[3,4],"target":[6,7,8],"difference":7,"link":false,"relation":1,"source_type":1,"target_type":0}
{"split":"test","source_id":"b","target_id":"b","source":[[0.5,0.1]],"target":[[0.5,0.1]],"difference":0,"link":false,"relation":3,"source_type":2,"target_type":2}
"#;

    #[test]
    fn test_parses_tokens_and_embeddings() {
        let dataset = PairDataset::from_reader(LINES.as_bytes(), None).unwrap();
        assert_eq!(dataset.len(), 3);

        let first = &dataset.records()[0];
        assert!(first.source.is_tokens());
        assert_eq!(first.mark.as_ref().map(Vec::len), Some(3));
        assert_eq!(first.link_class(), 0);

        let test = dataset.split(Split::Test);
        assert_eq!(test.len(), 1);
        assert!(!test[0].source.is_tokens());
        assert!(test[0].is_reflexive());
        assert_eq!(dataset.longest(), (3, 3));
    }

    #[test]
    fn test_distance_limit_only_filters_training() {
        let dataset = PairDataset::from_reader(LINES.as_bytes(), Some(5)).unwrap();
        assert_eq!(dataset.split(Split::Train).len(), 1);
        assert_eq!(dataset.split(Split::Test).len(), 1);
        assert!(matches!(
            dataset.require_split(Split::Validation),
            Err(DataError::EmptySplit(name)) if name == "validation"
        ));
    }

    #[test]
    fn test_bad_line_reports_its_number() {
        let input = "{\"split\":\"train\"}\n";
        let err = PairDataset::from_reader(input.as_bytes(), None).unwrap_err();
        assert!(matches!(err, DataError::Json { line: 1, .. }));
    }

    #[test]
    fn test_loader_covers_every_index_once() {
        let mut loader = PairLoader::new(10, 4, true);
        let batches = loader.epoch();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
