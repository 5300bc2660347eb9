use burn::config::Config;
use serde::{Deserialize, Serialize};

use super::attention::QueryPooling;
use super::heads::OutputClasses;
use super::masking::Distribution;
use super::self_attention::AttentionMerge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolingKind {
    #[default]
    Average,
    Max,
}

/// Settings of the recurrent family (net 7 and its non-residual and
/// context-free variants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentSettings {
    /// Source and target share one BiLSTM and its input norm.
    pub single_tower: bool,
    /// Pooling window on the proposition streams, 0 disables pooling.
    pub pooling: usize,
    /// Pooling window on the text stream, 0 reuses `pooling`.
    pub text_pooling: usize,
    pub pooling_kind: PoolingKind,
}

impl Default for RecurrentSettings {
    fn default() -> Self {
        Self {
            single_tower: false,
            pooling: 0,
            text_pooling: 0,
            pooling_kind: PoolingKind::Average,
        }
    }
}

/// Settings of the cross-attention family (net 9, 10 and 11).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoAttentionSettings {
    /// Net 11 only: source and target share one BiLSTM.
    pub single_tower: bool,
    pub shared_keys: bool,
    pub shared_importance: bool,
    pub query_pooling: QueryPooling,
    pub distribution: Distribution,
}

impl Default for CoAttentionSettings {
    fn default() -> Self {
        Self {
            single_tower: false,
            shared_keys: false,
            shared_importance: false,
            query_pooling: QueryPooling::Mean,
            distribution: Distribution::Softmax,
        }
    }
}

/// Settings of the scaled self-attention network (net 8). Hidden widths are
/// the input width divided by the corresponding scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaledAttentionSettings {
    pub embedding_scale: usize,
    pub res_scale: usize,
    pub final_scale: usize,
    /// Reduce every stream to `width / space_scale` before attention; 0 keeps the width.
    pub space_scale: usize,
    pub use_lstm: bool,
    pub merge: AttentionMerge,
    pub distribution: Distribution,
    pub classification: Distribution,
}

impl Default for ScaledAttentionSettings {
    fn default() -> Self {
        Self {
            embedding_scale: 10,
            res_scale: 15,
            final_scale: 10,
            space_scale: 2,
            use_lstm: true,
            merge: AttentionMerge::SelfAttention,
            distribution: Distribution::Softmax,
            classification: Distribution::Softmax,
        }
    }
}

/// One tag per network variant; each tag is built by its own builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Architecture {
    Net7(RecurrentSettings),
    Net7NonResidual(RecurrentSettings),
    Net7NoContext(RecurrentSettings),
    Net8(ScaledAttentionSettings),
    Net9(CoAttentionSettings),
    Net10(CoAttentionSettings),
    Net11(CoAttentionSettings),
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Net7(_) => "net_7",
            Architecture::Net7NonResidual(_) => "net_7_non_residual",
            Architecture::Net7NoContext(_) => "net_7_no_context",
            Architecture::Net8(_) => "net_8",
            Architecture::Net9(_) => "net_9",
            Architecture::Net10(_) => "net_10",
            Architecture::Net11(_) => "net_11",
        }
    }

    /// Whether the document stream is part of the input signature.
    pub fn has_text_input(&self) -> bool {
        !matches!(self, Architecture::Net7NoContext(_))
    }

    /// Whether the proposition mark channel is concatenated to the text stream.
    pub fn uses_mark(&self) -> bool {
        !matches!(
            self,
            Architecture::Net7NoContext(_) | Architecture::Net8(_)
        )
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Net7(RecurrentSettings::default())
    }
}

#[derive(Config, Debug)]
pub struct NetworkConfig {
    pub architecture: Architecture,

    pub outputs: OutputClasses,

    /// Groups of relation classes summed into each link class; `None` gives
    /// the link classifier its own weights.
    pub link_as_sum: Option<Vec<Vec<usize>>>,

    #[config(default = 200)]
    pub text_length: usize,

    #[config(default = 75)]
    pub proposition_length: usize,

    /// Width of the (pre-)embedded input vectors.
    #[config(default = 300)]
    pub embedding_dim: usize,

    /// Inputs are token ids into a frozen table of this many rows when set.
    pub vocab_size: Option<usize>,

    /// Half-width of the distance encoding, 0 drops the distance input.
    #[config(default = 5)]
    pub distance: usize,

    #[config(default = true)]
    pub context: bool,

    #[config(default = 0.001)]
    pub l2_weight: f64,

    #[config(default = 0.1)]
    pub dropout_embedder: f64,

    #[config(default = 0.1)]
    pub dropout_resnet: f64,

    #[config(default = 0.0)]
    pub dropout_final: f64,

    #[config(default = 2)]
    pub embedder_layers: usize,

    #[config(default = false)]
    pub shared_embedder: bool,

    /// Hidden width of the embedder, bottleneck and recurrent towers.
    #[config(default = 25)]
    pub embedding_size: usize,

    #[config(default = 2)]
    pub resnet_blocks: usize,

    #[config(default = 2)]
    pub resnet_layers: usize,

    #[config(default = 50)]
    pub res_size: usize,

    #[config(default = 20)]
    pub final_size: usize,

    #[config(default = true)]
    pub bn_embed: bool,

    #[config(default = true)]
    pub bn_res: bool,

    #[config(default = true)]
    pub bn_final: bool,

    #[config(default = false)]
    pub temporal_norm: bool,
}

impl NetworkConfig {
    /// Context is only consumed by variants that have a text input.
    pub fn uses_context(&self) -> bool {
        self.context && self.architecture.has_text_input()
    }

    pub fn uses_mark(&self) -> bool {
        self.uses_context() && self.architecture.uses_mark()
    }

    pub fn distance_width(&self) -> usize {
        2 * self.distance
    }

    /// Small cdcp-shaped configuration used by the demo command and tests.
    pub fn demo(architecture: Architecture) -> Self {
        NetworkConfig::new(architecture, OutputClasses::new(2, 5, 5, 5))
            .with_link_as_sum(Some(vec![vec![0, 2], vec![1, 3, 4]]))
            .with_text_length(24)
            .with_proposition_length(8)
            .with_embedding_dim(16)
            .with_embedding_size(6)
            .with_res_size(8)
            .with_final_size(10)
            .with_embedder_layers(1)
            .with_resnet_blocks(1)
            .with_distance(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_yaml_round_trip() {
        let architecture = Architecture::Net8(ScaledAttentionSettings {
            merge: AttentionMerge::CoarseCoAttention,
            distribution: Distribution::Sparsemax,
            ..Default::default()
        });
        let yaml = serde_yaml::to_string(&architecture).unwrap();
        assert!(yaml.contains("type: net8"));
        assert!(yaml.contains("coarse_co_attention"));

        let parsed: Architecture = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, architecture);
    }

    #[test]
    fn test_partial_settings_use_defaults() {
        let parsed: Architecture = serde_yaml::from_str("type: net7\nsingle_tower: true\n").unwrap();
        assert_eq!(
            parsed,
            Architecture::Net7(RecurrentSettings {
                single_tower: true,
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_context_flags() {
        let config = NetworkConfig::demo(Architecture::Net7NoContext(RecurrentSettings::default()));
        assert!(!config.uses_context());
        assert!(!config.uses_mark());

        let config = NetworkConfig::demo(Architecture::Net8(ScaledAttentionSettings::default()));
        assert!(config.uses_context());
        assert!(!config.uses_mark());
        assert_eq!(config.distance_width(), 6);
    }
}
