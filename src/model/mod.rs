pub mod attention;
pub mod config;
pub mod embedder;
pub mod heads;
pub mod layers;
pub mod link;
pub mod lookup;
pub mod masking;
pub mod network;
pub mod recurrent;
pub mod residual;
pub mod self_attention;
pub mod signature;

pub use attention::{CrossAttention, CrossAttentionConfig, QueryPooling};
pub use config::{
    Architecture, CoAttentionSettings, NetworkConfig, PoolingKind, RecurrentSettings,
    ScaledAttentionSettings,
};
pub use embedder::{EmbedderBank, EmbedderConfig};
pub use heads::{OutputClasses, OutputHeads};
pub use link::LabelPartition;
pub use lookup::FrozenLookup;
pub use masking::Distribution;
pub use network::{ArgumentNet, ParameterStats};
pub use residual::{ResidualConfig, ResidualTrunk};
pub use self_attention::AttentionMerge;
pub use signature::{
    ArgumentBatch, ArgumentOutput, InputName, ModelSignature, OutputName, StreamInput, StreamKind,
};
