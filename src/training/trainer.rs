use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::checkpoint::{checkpoint_exists, save_checkpoint, write_run_info, RunInfo};
use super::evaluation::{score, PairOutcome, Scores};
use crate::data::{PairBatch, PairBatcher, PairDataset, PairLoader, PairRecord, PairTargets, Split};
use crate::error::TrainError;
use crate::model::config::NetworkConfig;
use crate::model::{ArgumentNet, ArgumentOutput};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before the log.
const EPSILON: f64 = 1e-7;

/// Validation score that selects the best epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    /// Macro F1 over the positive relation labels.
    Relations,
    #[default]
    Links,
    Propositions,
    AvgLp,
    AvgAll,
    /// Validation loss, lower is better.
    Loss,
}

impl Monitor {
    /// Higher is better for every monitor.
    pub fn value(&self, scores: &Scores, loss: f64) -> f64 {
        match self {
            Monitor::Relations => scores.relation_macro,
            Monitor::Links => scores.link,
            Monitor::Propositions => scores.proposition_macro,
            Monitor::AvgLp => scores.avg_lp,
            Monitor::AvgAll => scores.avg_all,
            Monitor::Loss => -loss,
        }
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = "String::from(\"argmine\")")]
    pub name: String,

    #[config(default = 1000)]
    pub epochs: usize,

    #[config(default = 200)]
    pub batch_size: usize,

    #[config(default = 0.003)]
    pub lr_alfa: f64,

    #[config(default = 0.001)]
    pub lr_kappa: f64,

    #[config(default = 0.9)]
    pub beta_1: f64,

    #[config(default = 0.999)]
    pub beta_2: f64,

    /// Weights of the link, relation, source and target losses.
    #[config(default = "[0.0, 10.0, 1.0, 1.0]")]
    pub loss_weights: [f64; 4],

    #[config(default = 100)]
    pub patience: usize,

    #[config(default = "Monitor::Links")]
    pub monitor: Monitor,

    #[config(default = 1)]
    pub iterations: usize,

    #[config(default = false)]
    pub overwrite: bool,

    #[config(default = true)]
    pub shuffle: bool,

    pub checkpoint_dir: Option<PathBuf>,
}

impl TrainingConfig {
    /// `alfa / (1 + kappa * epoch)`.
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        self.lr_alfa / (1.0 + self.lr_kappa * epoch as f64)
    }

    pub fn iteration_name(&self, iteration: usize) -> String {
        format!("{}_{}", self.name, iteration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub name: String,
    pub skipped: bool,
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_score: Option<f64>,
    pub validation: Option<Scores>,
    pub test: Option<Scores>,
}

impl IterationReport {
    fn skipped(name: String) -> Self {
        Self {
            name,
            skipped: true,
            epochs_run: 0,
            best_epoch: None,
            best_score: None,
            validation: None,
            test: None,
        }
    }
}

/// Categorical cross-entropy between predicted distributions and one-hot
/// targets, averaged over the batch.
pub fn categorical_crossentropy<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let log = probs.clamp(EPSILON, 1.0 - EPSILON).log();
    (targets * log).sum_dim(1).neg().mean()
}

pub fn weighted_loss<B: Backend>(
    output: &ArgumentOutput<B>,
    targets: &PairTargets<B>,
    weights: &[f64; 4],
) -> Tensor<B, 1> {
    let terms = [
        (output.link.clone(), targets.link.clone()),
        (output.relation.clone(), targets.relation.clone()),
        (output.source.clone(), targets.source.clone()),
        (output.target.clone(), targets.target.clone()),
    ];
    terms
        .into_iter()
        .zip(weights)
        .map(|((probs, target), &weight)| categorical_crossentropy(probs, target).mul_scalar(weight))
        .reduce(|acc, term| acc + term)
        .unwrap_or_else(|| Tensor::zeros([1], &output.link.device()))
}

fn to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let [_, width] = tensor.dims();
    let values: Vec<f32> = tensor.into_data().iter::<f32>().collect();
    values.chunks(width.max(1)).map(<[f32]>::to_vec).collect()
}

/// Runs `model` over `records` and returns the mean loss and the scores.
pub fn evaluate<B: Backend>(
    model: &ArgumentNet<B>,
    batcher: &PairBatcher,
    records: &[&PairRecord],
    batch_size: usize,
    loss_weights: &[f64; 4],
    positive_relations: &[usize],
    device: &B::Device,
) -> Result<(f64, Scores), TrainError> {
    let mut outcomes = Vec::with_capacity(records.len());
    let mut total_loss = 0.0;

    for chunk in records.chunks(batch_size.max(1)) {
        let PairBatch { inputs, targets } = batcher.batch::<B>(chunk, device)?;
        let output = model.forward(inputs)?;
        let loss: f64 = weighted_loss(&output, &targets, loss_weights)
            .into_scalar()
            .elem();
        total_loss += loss * chunk.len() as f64;

        let rows = (
            to_rows(output.link),
            to_rows(output.relation),
            to_rows(output.source),
            to_rows(output.target),
        );
        for (index, record) in chunk.iter().enumerate() {
            outcomes.push(PairOutcome {
                source_id: record.source_id.clone(),
                target_id: record.target_id.clone(),
                link: record.link_class(),
                relation: record.relation,
                source_type: record.source_type,
                target_type: record.target_type,
                link_probs: rows.0[index].clone(),
                relation_probs: rows.1[index].clone(),
                source_probs: rows.2[index].clone(),
                target_probs: rows.3[index].clone(),
            });
        }
    }

    let mean_loss = total_loss / records.len().max(1) as f64;
    Ok((mean_loss, score(&outcomes, positive_relations)))
}

/// Relation labels counted as links: the first partition group, or every
/// relation class when the link head is independent.
pub fn positive_relations(network: &NetworkConfig) -> Vec<usize> {
    match &network.link_as_sum {
        Some(groups) => groups.first().cloned().unwrap_or_default(),
        None => (0..network.outputs.relation).collect(),
    }
}

/// Builds the network, installing the dataset's word vectors when it has
/// them.
pub fn init_model<B: Backend>(
    network: &NetworkConfig,
    dataset: &PairDataset,
    device: &B::Device,
) -> Result<ArgumentNet<B>, TrainError> {
    let model = network.init(device)?;
    match dataset.embeddings() {
        Some(table) => {
            debug!(vocab_size = table.vocab_size(), dim = table.dim(), "using pre-trained embeddings");
            Ok(model.with_lookup(table.lookup(device)?)?)
        }
        None => {
            if network.vocab_size.is_some() {
                warn!("token inputs without an embedding table, lookup rows are random");
            }
            Ok(model)
        }
    }
}

/// Trains one iteration and returns its best model (by the monitored
/// validation score) with the report.
pub fn train_iteration<B: AutodiffBackend>(
    network: &NetworkConfig,
    config: &TrainingConfig,
    dataset: &PairDataset,
    name: &str,
    device: &B::Device,
) -> Result<(ArgumentNet<B::InnerBackend>, IterationReport), TrainError> {
    let train_records = dataset.require_split(Split::Train)?;
    let validation_records = dataset.split(Split::Validation);
    let validation_records = if validation_records.is_empty() {
        warn!("no validation split, monitoring on the training split");
        train_records.clone()
    } else {
        validation_records
    };
    let positive = positive_relations(network);

    let batcher = PairBatcher::new(network);
    let (longest_text, longest_prop) = dataset.longest();
    if longest_prop > network.proposition_length
        || (batcher.context && longest_text > network.text_length)
    {
        warn!(
            longest_text,
            longest_prop, "sequences longer than the network inputs keep only their last steps"
        );
    }

    let mut model: ArgumentNet<B> = init_model(network, dataset, device)?;
    let mut optimizer = AdamConfig::new()
        .with_beta_1(config.beta_1 as f32)
        .with_beta_2(config.beta_2 as f32)
        .init();
    model.print_summary();

    let mut loader = PairLoader::new(train_records.len(), config.batch_size, config.shuffle);
    let mut best: Option<(usize, f64, Scores, ArgumentNet<B::InnerBackend>)> = None;
    let mut waited = 0usize;
    let mut epochs_run = 0usize;

    info!(name, epochs = config.epochs, pairs = train_records.len(), "starting training");

    for epoch in 0..config.epochs {
        let lr = config.learning_rate(epoch);
        let mut running_loss = 0.0;
        let mut seen = 0usize;

        for indices in loader.epoch() {
            let records: Vec<&PairRecord> = indices.iter().map(|&i| train_records[i]).collect();
            let PairBatch { inputs, targets } = batcher.batch::<B>(&records, device)?;
            let output = model.forward(inputs)?;
            let loss = weighted_loss(&output, &targets, &config.loss_weights) + model.l2_penalty();

            let loss_value: f64 = loss.clone().into_scalar().elem();
            running_loss += loss_value * records.len() as f64;
            seen += records.len();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr, model, grads);
        }
        epochs_run = epoch + 1;

        let valid = model.valid();
        let (validation_loss, scores) = evaluate(
            &valid,
            &batcher,
            &validation_records,
            config.batch_size,
            &config.loss_weights,
            &positive,
            device,
        )?;
        let value = config.monitor.value(&scores, validation_loss);

        info!(
            epoch,
            lr,
            train_loss = running_loss / seen.max(1) as f64,
            validation_loss,
            "{}",
            scores
        );

        let improved = best.as_ref().map_or(true, |(_, score, _, _)| value > *score);
        if improved {
            debug!(epoch, value, "monitored score improved");
            if let Some(dir) = &config.checkpoint_dir {
                save_checkpoint(&valid, dir, name)?;
            }
            best = Some((epoch, value, scores, valid));
            waited = 0;
        } else {
            waited += 1;
            if waited > config.patience {
                info!(epoch, patience = config.patience, "early stopping");
                break;
            }
        }
    }

    let (best_epoch, best_score, validation, best_model) = match best {
        Some((epoch, value, scores, model)) => (Some(epoch), Some(value), Some(scores), model),
        None => (None, None, None, model.valid()),
    };

    let test_records = dataset.split(Split::Test);
    let test = if test_records.is_empty() {
        None
    } else {
        let (_, scores) = evaluate(
            &best_model,
            &batcher,
            &test_records,
            config.batch_size,
            &config.loss_weights,
            &positive,
            device,
        )?;
        info!(name, "test: {}", scores);
        Some(scores)
    };

    let report = IterationReport {
        name: name.to_string(),
        skipped: false,
        epochs_run,
        best_epoch,
        best_score,
        validation,
        test,
    };
    Ok((best_model, report))
}

/// Runs every configured iteration. Iterations whose best checkpoint exists
/// are skipped unless `overwrite` is set.
pub fn train<B: AutodiffBackend>(
    network: &NetworkConfig,
    config: &TrainingConfig,
    dataset: &PairDataset,
    device: &B::Device,
) -> Result<Vec<IterationReport>, TrainError> {
    if let Some(dir) = &config.checkpoint_dir {
        let path = write_run_info(
            dir,
            &RunInfo {
                name: config.name.clone(),
                network: network.clone(),
                training: config.clone(),
            },
        )?;
        info!(path = %path.display(), "wrote run info");
    }

    let mut reports = Vec::with_capacity(config.iterations);
    for iteration in 0..config.iterations {
        let name = config.iteration_name(iteration);
        let exists = config
            .checkpoint_dir
            .as_deref()
            .map_or(false, |dir| checkpoint_exists(dir, &name));
        if exists && !config.overwrite {
            info!(name, "checkpoint exists, skipping iteration");
            reports.push(IterationReport::skipped(name));
            continue;
        }

        let (_, report) = train_iteration::<B>(network, config, dataset, &name, device)?;
        reports.push(report);
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PairRecord, Sequence};
    use crate::model::config::{Architecture, RecurrentSettings};
    use crate::training::checkpoint::{best_checkpoint_path, load_checkpoint, run_info_path};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn tiny_dataset() -> PairDataset {
        let mut records = Vec::new();
        for (index, split) in [Split::Train, Split::Train, Split::Train, Split::Validation, Split::Test]
            .into_iter()
            .enumerate()
        {
            for offset in 0..3usize {
                let link = offset == 1;
                records.push(PairRecord {
                    split,
                    source_id: format!("{}-{}", index, offset),
                    target_id: format!("{}-{}", index, offset + 1),
                    text_id: Some(index.to_string()),
                    source: Sequence::Tokens(vec![1 + offset as u32, 2, 3]),
                    target: Sequence::Tokens(vec![4, 5 + offset as u32]),
                    text: Some(Sequence::Tokens(vec![1, 2, 3, 4, 5, 6, 7])),
                    mark: None,
                    difference: 1,
                    link,
                    relation: if link { 0 } else { 1 },
                    source_type: offset % 2,
                    target_type: (offset + 1) % 2,
                });
            }
        }
        PairDataset::new(records)
    }

    fn network() -> NetworkConfig {
        NetworkConfig::demo(Architecture::Net7(RecurrentSettings::default()))
            .with_vocab_size(Some(12))
    }

    #[test]
    fn test_learning_rate_annealing() {
        let config = TrainingConfig::new().with_lr_alfa(0.005).with_lr_kappa(0.001);
        assert!((config.learning_rate(0) - 0.005).abs() < 1e-12);
        assert!((config.learning_rate(1000) - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_crossentropy_of_confident_prediction_is_small() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.5, 0.5]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);
        let loss: f32 = categorical_crossentropy(probs, targets).into_scalar();
        assert!((loss - std::f32::consts::LN_2 / 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_monitor_loss_prefers_lower_values() {
        let scores = Scores::default();
        assert!(Monitor::Loss.value(&scores, 0.1) > Monitor::Loss.value(&scores, 0.5));
    }

    #[test]
    fn test_train_iteration_saves_a_loadable_best_model() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let network = network();
        let config = TrainingConfig::new()
            .with_name("tiny".to_string())
            .with_epochs(2)
            .with_batch_size(4)
            .with_checkpoint_dir(Some(dir.path().to_path_buf()));

        let (best, report) =
            train_iteration::<TestAutodiffBackend>(&network, &config, &tiny_dataset(), "tiny_0", &device)
                .unwrap();
        assert_eq!(report.epochs_run, 2);
        assert!(report.best_epoch.is_some());
        assert!(report.test.is_some());

        let path = best_checkpoint_path(dir.path(), "tiny_0");
        assert!(path.exists());
        let loaded = load_checkpoint(network.init::<TestBackend>(&device).unwrap(), &path, &device).unwrap();

        let batcher = PairBatcher::new(&network);
        let dataset = tiny_dataset();
        let records = dataset.split(Split::Test);
        let expected = best.forward(batcher.batch(&records, &device).unwrap().inputs).unwrap();
        let actual = loaded.forward(batcher.batch(&records, &device).unwrap().inputs).unwrap();
        expected
            .relation
            .into_data()
            .assert_approx_eq(&actual.relation.into_data(), 5);
    }

    #[test]
    fn test_pretrained_embeddings_are_installed_and_stay_frozen() {
        let device = Default::default();
        let rows: Vec<Vec<f32>> = (0..12)
            .map(|id| vec![id as f32 / 10.0; 16])
            .collect();
        let table = crate::data::EmbeddingTable::from_rows(rows).unwrap();
        let dataset = tiny_dataset().with_embeddings(table);
        let network = network();

        let lookup_rows = |model: &ArgumentNet<TestBackend>| -> Vec<f32> {
            let ids = Tensor::<TestBackend, 2, Int>::from_ints([[0, 5, 11]], &device);
            model.lookup().unwrap().forward(ids).into_data().to_vec().unwrap()
        };
        let mut expected = vec![0.0f32; 16];
        expected.extend(vec![0.5f32; 16]);
        expected.extend(vec![1.1f32; 16]);

        let model = init_model::<TestBackend>(&network, &dataset, &device).unwrap();
        assert_eq!(lookup_rows(&model), expected);

        let config = TrainingConfig::new().with_epochs(2).with_batch_size(4);
        let (best, _) =
            train_iteration::<TestAutodiffBackend>(&network, &config, &dataset, "frozen", &device)
                .unwrap();
        let trained = lookup_rows(&best);
        for (a, b) in trained.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mismatched_embedding_table_fails_training() {
        let device = Default::default();
        let table = crate::data::EmbeddingTable::from_rows(vec![vec![0.0; 16]; 5]).unwrap();
        let dataset = tiny_dataset().with_embeddings(table);
        let err = init_model::<TestBackend>(&network(), &dataset, &device).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Model(crate::error::ModelError::WidthMismatch { expected: 12, actual: 5, .. })
        ));
    }

    #[test]
    fn test_existing_iterations_are_skipped() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::new()
            .with_name("tiny".to_string())
            .with_epochs(1)
            .with_batch_size(8)
            .with_iterations(2)
            .with_checkpoint_dir(Some(dir.path().to_path_buf()));

        let first = train::<TestAutodiffBackend>(&network(), &config, &tiny_dataset(), &device).unwrap();
        assert!(first.iter().all(|r| !r.skipped));
        assert!(run_info_path(dir.path(), "tiny").exists());

        let second = train::<TestAutodiffBackend>(&network(), &config, &tiny_dataset(), &device).unwrap();
        assert!(second.iter().all(|r| r.skipped));
    }
}
