pub mod checkpoint;
pub mod evaluation;
pub mod trainer;

pub use checkpoint::{find_checkpoints, load_checkpoint, save_checkpoint, RunInfo};
pub use evaluation::{score, PairOutcome, Scores};
pub use trainer::{evaluate, train, train_iteration, IterationReport, Monitor, TrainingConfig};
