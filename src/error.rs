use burn::record::RecorderError;
use thiserror::Error;

/// Contract violations raised while building an [`ArgumentNet`](crate::model::ArgumentNet)
/// or while feeding it a batch.
///
/// Construction errors are reported before any tensor is allocated; input
/// errors are reported by `forward` before any layer runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("{component}: `{field}` must be greater than zero")]
    ZeroWidth {
        component: &'static str,
        field: &'static str,
    },

    #[error("residual trunk with {blocks} block(s) needs at least one layer per block")]
    EmptyBlock { blocks: usize },

    #[error("stream `{stream}` has zero timesteps")]
    EmptyStream { stream: &'static str },

    #[error("pooling window {window} does not fit stream `{stream}` of length {length}")]
    PoolingTooLarge {
        stream: &'static str,
        window: usize,
        length: usize,
    },

    #[error("relation class {index} is outside 0..{classes}")]
    PartitionOutOfRange { index: usize, classes: usize },

    #[error("relation class {index} is assigned to more than one link group")]
    PartitionOverlap { index: usize },

    #[error("relation class {index} is not assigned to any link group")]
    PartitionIncomplete { index: usize },

    #[error("link group {group} is empty")]
    PartitionEmptyGroup { group: usize },

    #[error("partition has {groups} group(s) but the link head predicts {link_classes} class(es)")]
    PartitionGroupCount { groups: usize, link_classes: usize },

    #[error("{component}: expected width {expected}, got {actual}")]
    WidthMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stream `{stream}` is not bound to any embedder block")]
    UnboundStream { stream: &'static str },

    #[error("missing input `{0}`")]
    MissingInput(&'static str),

    #[error("input `{0}` is not part of this architecture's signature")]
    UnexpectedInput(&'static str),

    #[error("input `{name}` should be {expected}, got {actual}")]
    InputKind {
        name: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("input `{name}` has shape {actual:?}, expected {expected:?}")]
    InputShape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("link head has neither its own weights nor a relation partition")]
    MissingLinkHead,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {record}: {message}")]
    Record { record: usize, message: String },

    #[error("dataset split `{0}` is empty")]
    EmptySplit(String),

    #[error("embedding table: {0}")]
    Embeddings(String),
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0:?}")]
    Checkpoint(RecorderError),

    #[error("failed to write run info: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RecorderError> for TrainError {
    fn from(err: RecorderError) -> Self {
        TrainError::Checkpoint(err)
    }
}
