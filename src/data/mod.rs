pub mod batcher;
pub mod dataset;
pub mod distance;
pub mod embeddings;

pub use batcher::{PairBatch, PairBatcher, PairTargets};
pub use dataset::{PairDataset, PairLoader, PairRecord, Sequence, Split};
pub use distance::encode_distance;
pub use embeddings::EmbeddingTable;
