use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::{EmbeddingTable, PairDataset};
use crate::error::{ConfigError, DataError};
use crate::model::config::{
    Architecture, CoAttentionSettings, NetworkConfig, RecurrentSettings,
};
use crate::model::heads::OutputClasses;
use crate::training::{Monitor, TrainingConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullConfig {
    pub model: NetworkConfig,
    #[serde(default)]
    pub training: TrainingSettings,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lr_alfa")]
    pub lr_alfa: f64,
    #[serde(default = "default_lr_kappa")]
    pub lr_kappa: f64,
    #[serde(default = "default_beta_1")]
    pub beta_1: f64,
    #[serde(default = "default_beta_2")]
    pub beta_2: f64,
    #[serde(default = "default_loss_weights")]
    pub loss_weights: [f64; 4],
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub monitor: Monitor,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        TrainingSettings {
            name: default_name(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            lr_alfa: default_lr_alfa(),
            lr_kappa: default_lr_kappa(),
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            loss_weights: default_loss_weights(),
            patience: default_patience(),
            monitor: Monitor::default(),
            iterations: default_iterations(),
            overwrite: false,
            checkpoint_dir: None,
        }
    }
}

impl TrainingSettings {
    pub fn to_training_config(&self) -> TrainingConfig {
        TrainingConfig::new()
            .with_name(self.name.clone())
            .with_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_lr_alfa(self.lr_alfa)
            .with_lr_kappa(self.lr_kappa)
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_loss_weights(self.loss_weights)
            .with_patience(self.patience)
            .with_monitor(self.monitor)
            .with_iterations(self.iterations)
            .with_overwrite(self.overwrite)
            .with_checkpoint_dir(self.checkpoint_dir.as_ref().map(PathBuf::from))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// JSON Lines file of pair records.
    pub path: String,
    /// Training pairs farther apart than this are dropped.
    #[serde(default)]
    pub distance_train_limit: Option<usize>,
    /// JSON array of word vectors, one row per token id, for token inputs.
    #[serde(default)]
    pub embeddings: Option<String>,
}

impl DatasetConfig {
    pub fn load(&self) -> Result<PairDataset, DataError> {
        let dataset = PairDataset::from_jsonl(&self.path, self.distance_train_limit)?;
        match &self.embeddings {
            Some(path) => Ok(dataset.with_embeddings(EmbeddingTable::from_json(path)?)),
            None => Ok(dataset),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_type")]
    pub backend_type: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend_type: default_backend_type(),
        }
    }
}

fn default_name() -> String {
    "argmine".to_string()
}
fn default_epochs() -> usize {
    1000
}
fn default_batch_size() -> usize {
    200
}
fn default_lr_alfa() -> f64 {
    0.003
}
fn default_lr_kappa() -> f64 {
    0.001
}
fn default_beta_1() -> f64 {
    0.9
}
fn default_beta_2() -> f64 {
    0.999
}
fn default_loss_weights() -> [f64; 4] {
    [0.0, 10.0, 1.0, 1.0]
}
fn default_patience() -> usize {
    100
}
fn default_iterations() -> usize {
    1
}
fn default_backend_type() -> String {
    "ndarray".to_string()
}

/// Output classes of the cdcp corpus: link, five relations, five
/// proposition types.
fn cdcp_outputs() -> OutputClasses {
    OutputClasses::new(2, 5, 5, 5)
}

fn cdcp_partition() -> Vec<Vec<usize>> {
    vec![vec![0, 2], vec![1, 3, 4]]
}

impl FullConfig {
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: FullConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Builds the network once on the CPU backend to surface construction
    /// errors before any data is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = Default::default();
        self.model
            .init::<burn::backend::NdArray<f32>>(&device)
            .map(|_| ())
            .map_err(ConfigError::from)
    }

    /// Net 11 on cdcp-shaped data with 300-wide embeddings.
    pub fn default_config() -> Self {
        let model = NetworkConfig::new(
            Architecture::Net11(CoAttentionSettings {
                single_tower: true,
                ..Default::default()
            }),
            cdcp_outputs(),
        )
        .with_link_as_sum(Some(cdcp_partition()))
        .with_embedding_size(50)
        .with_embedder_layers(4)
        .with_resnet_blocks(1)
        .with_res_size(5)
        .with_final_size(20)
        .with_l2_weight(0.0001)
        .with_dropout_final(0.1);

        FullConfig {
            model,
            training: TrainingSettings {
                name: "cdcp11".to_string(),
                lr_alfa: 0.005,
                beta_2: 0.9999,
                batch_size: 500,
                checkpoint_dir: Some("network_models".to_string()),
                ..Default::default()
            },
            dataset: DatasetConfig {
                path: "data/cdcp.jsonl".to_string(),
                distance_train_limit: None,
                embeddings: None,
            },
            backend: BackendConfig::default(),
        }
    }

    /// Small net 7 that trains in seconds on the CPU.
    pub fn demo_config() -> Self {
        let model = NetworkConfig::demo(Architecture::Net7(RecurrentSettings {
            pooling: 2,
            ..Default::default()
        }))
        .with_vocab_size(Some(1000));

        FullConfig {
            model,
            training: TrainingSettings {
                name: "demo".to_string(),
                epochs: 5,
                batch_size: 16,
                patience: 2,
                checkpoint_dir: None,
                ..Default::default()
            },
            dataset: DatasetConfig {
                path: "data/demo.jsonl".to_string(),
                distance_train_limit: Some(10),
                embeddings: None,
            },
            backend: BackendConfig::default(),
        }
    }
}
