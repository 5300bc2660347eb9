use argmine::config::FullConfig;
use argmine::data::{PairBatcher, PairDataset, Split};
use argmine::model::{
    Architecture, ArgumentBatch, CoAttentionSettings, InputName, NetworkConfig, OutputClasses,
    RecurrentSettings, StreamInput,
};
use argmine::training::checkpoint::run_info_path;
use argmine::training::trainer::positive_relations;
use argmine::training::{evaluate, find_checkpoints, load_checkpoint, train};
use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Int, Tensor, TensorData};
use std::io::Write;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

/// Two documents per split, every ordered pair of their three propositions.
fn write_corpus(path: &std::path::Path) {
    let mut file = std::fs::File::create(path).unwrap();
    for (split, documents) in [("train", 0..4u32), ("validation", 4..6), ("test", 6..8)] {
        for document in documents {
            let text: Vec<u32> = (1..=18).map(|t| t + document).collect();
            for source in 0..3i64 {
                for target in 0..3i64 {
                    let link = target == source + 1;
                    let mark: Vec<[f32; 2]> = (0..18)
                        .map(|t| {
                            [
                                if t / 6 == source { 1.0 } else { 0.0 },
                                if t / 6 == target { 1.0 } else { 0.0 },
                            ]
                        })
                        .collect();
                    let record = serde_json::json!({
                        "split": split,
                        "source_id": format!("{}-{}", document, source),
                        "target_id": format!("{}-{}", document, target),
                        "text_id": document.to_string(),
                        "source": &text[(source as usize) * 6..(source as usize + 1) * 6],
                        "target": &text[(target as usize) * 6..(target as usize + 1) * 6],
                        "text": &text,
                        "mark": mark,
                        "difference": target - source,
                        "link": link,
                        "relation": if link { 0 } else { 1 },
                        "source_type": (source % 2) as usize,
                        "target_type": (target % 2) as usize,
                    });
                    writeln!(file, "{}", record).unwrap();
                }
            }
        }
    }
}

#[test]
fn minimal_network_exposes_named_inputs_and_outputs() {
    let device = Default::default();
    let config = NetworkConfig::new(
        Architecture::Net7(RecurrentSettings {
            single_tower: true,
            ..Default::default()
        }),
        OutputClasses::new(2, 8, 2, 2),
    )
    .with_proposition_length(10)
    .with_embedding_dim(50)
    .with_embedder_layers(0)
    .with_resnet_blocks(1)
    .with_resnet_layers(2)
    .with_distance(5)
    .with_context(false);

    let net = config.init::<TestBackend>(&device).unwrap();
    assert_eq!(net.signature().inputs.len(), 4);
    assert_eq!(net.signature().output_widths(), vec![2, 8, 2, 2]);

    let net = config.with_context(true).init::<TestBackend>(&device).unwrap();
    assert_eq!(net.signature().inputs.len(), 5);
    assert!(net.signature().input(InputName::Mark).is_some());
}

#[test]
fn uniform_relations_sum_into_link_groups() {
    let device = Default::default();
    let config = NetworkConfig::demo(Architecture::Net9(CoAttentionSettings::default()))
        .with_vocab_size(Some(20));
    let net = config.init::<TestBackend>(&device).unwrap();

    let ids = |length: usize| {
        let values: Vec<i64> = (0..2 * length).map(|i| 1 + (i % 7) as i64).collect();
        StreamInput::Tokens(Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(values, [2, length]),
            &device,
        ))
    };
    let batch = ArgumentBatch::new(ids(config.proposition_length), ids(config.proposition_length))
        .with_text(ids(config.text_length))
        .with_distance(Tensor::zeros([2, config.distance_width()], &device))
        .with_mark(Tensor::zeros([2, config.text_length, 2], &device));

    let out = net.forward(batch).unwrap();
    let relation: Vec<f32> = out.relation.into_data().to_vec().unwrap();
    let link: Vec<f32> = out.link.into_data().to_vec().unwrap();
    for row in 0..2 {
        let r = &relation[row * 5..(row + 1) * 5];
        assert!((link[row * 2] - (r[0] + r[2])).abs() < 1e-5);
        assert!((link[row * 2 + 1] - (r[1] + r[3] + r[4])).abs() < 1e-5);
    }
}

#[test]
fn train_then_evaluate_saved_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("pairs.jsonl");
    write_corpus(&corpus);

    let mut config = FullConfig::demo_config();
    config.dataset.path = corpus.display().to_string();
    config.dataset.distance_train_limit = None;
    config.training.name = "pipeline".to_string();
    config.training.epochs = 2;
    config.training.iterations = 2;
    config.training.batch_size = 8;
    config.training.checkpoint_dir = Some(dir.path().join("models").display().to_string());
    config.validate().unwrap();

    let device = Default::default();
    let dataset = PairDataset::from_jsonl(&config.dataset.path, None).unwrap();
    assert_eq!(dataset.len(), 8 * 9);

    let training = config.training.to_training_config();
    let reports = train::<TestAutodiffBackend>(&config.model, &training, &dataset, &device).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "pipeline_0");
    assert!(reports.iter().all(|r| !r.skipped && r.epochs_run == 2 && r.test.is_some()));

    let models = dir.path().join("models");
    assert!(run_info_path(&models, "pipeline").exists());
    let checkpoints = find_checkpoints(&models, "pipeline");
    assert_eq!(checkpoints.len(), 2);

    let rerun = train::<TestAutodiffBackend>(&config.model, &training, &dataset, &device).unwrap();
    assert!(rerun.iter().all(|r| r.skipped));

    let batcher = PairBatcher::new(&config.model);
    let records = dataset.require_split(Split::Test).unwrap();
    let positive = positive_relations(&config.model);
    assert_eq!(positive, vec![0, 2]);

    for path in checkpoints {
        let model = config.model.init::<TestBackend>(&device).unwrap();
        let model = load_checkpoint(model, &path, &device).unwrap();
        let (loss, scores) = evaluate(
            &model,
            &batcher,
            &records,
            training.batch_size,
            &training.loss_weights,
            &positive,
            &device,
        )
        .unwrap();
        assert!(loss.is_finite());
        for value in [scores.link, scores.relation_macro, scores.proposition_macro, scores.avg_all] {
            assert!((0.0..=1.0).contains(&value));
        }
    }
}
