use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::trainer::TrainingConfig;
use crate::error::TrainError;
use crate::model::config::NetworkConfig;
use crate::model::ArgumentNet;

pub type DefaultRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub fn default_recorder() -> DefaultRecorder {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Path of the best checkpoint of run `name`. The extension is spelled out
/// so that dots inside `name` survive.
pub fn best_checkpoint_path(checkpoint_dir: &Path, name: &str) -> PathBuf {
    checkpoint_dir.join(format!("{}_best.mpk", name))
}

pub fn checkpoint_exists(checkpoint_dir: &Path, name: &str) -> bool {
    best_checkpoint_path(checkpoint_dir, name).exists()
}

pub fn save_checkpoint<B: Backend>(
    model: &ArgumentNet<B>,
    checkpoint_dir: &Path,
    name: &str,
) -> Result<PathBuf, RecorderError> {
    fs::create_dir_all(checkpoint_dir).map_err(|e| RecorderError::Unknown(e.to_string()))?;

    let path = best_checkpoint_path(checkpoint_dir, name);
    let recorder = default_recorder();
    model.clone().save_file(&path, &recorder)?;

    info!(path = %path.display(), "saved checkpoint");
    Ok(path)
}

/// Loads weights into `model`, which must be built from the same network
/// configuration as the saved one.
pub fn load_checkpoint<B: Backend>(
    model: ArgumentNet<B>,
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<ArgumentNet<B>, RecorderError> {
    let recorder = default_recorder();
    model.load_file(checkpoint_path.to_path_buf(), &recorder, device)
}

/// Best checkpoints of every iteration of run `name`, in iteration order.
pub fn find_checkpoints(checkpoint_dir: &Path, name: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(checkpoint_dir) else {
        return Vec::new();
    };
    let prefix = format!("{}_", name);

    let mut checkpoints: Vec<(usize, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let stem = path.file_stem()?.to_str()?;
            let iteration = stem.strip_prefix(&prefix)?.strip_suffix("_best")?;
            let iteration: usize = iteration.parse().ok()?;
            Some((iteration, path))
        })
        .collect();

    checkpoints.sort_by_key(|(iteration, _)| *iteration);
    checkpoints.into_iter().map(|(_, path)| path).collect()
}

/// Parameters of a training run, written next to its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub name: String,
    pub network: NetworkConfig,
    pub training: TrainingConfig,
}

pub fn run_info_path(checkpoint_dir: &Path, name: &str) -> PathBuf {
    checkpoint_dir.join(format!("{}_info.yaml", name))
}

pub fn write_run_info(checkpoint_dir: &Path, info: &RunInfo) -> Result<PathBuf, TrainError> {
    fs::create_dir_all(checkpoint_dir)?;
    let path = run_info_path(checkpoint_dir, &info.name);
    let content = serde_yaml::to_string(info).map_err(crate::error::ConfigError::from)?;
    fs::write(&path, content)?;
    Ok(path)
}

pub fn read_run_info(checkpoint_dir: &Path, name: &str) -> Result<RunInfo, TrainError> {
    let content = fs::read_to_string(run_info_path(checkpoint_dir, name))?;
    let info = serde_yaml::from_str(&content).map_err(crate::error::ConfigError::from)?;
    Ok(info)
}
