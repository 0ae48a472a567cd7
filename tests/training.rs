mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};

use jrl::app;
use jrl::batch::Batch;
use jrl::progress::{ProgressSink, TrainingReport};
use jrl::train::{train, CheckpointPolicy};
use jrl::{BatchGenerator, Config, EmbeddingModel, MultiViewModel, StepMode, StepOutput};

#[derive(Default)]
struct Recorder {
    started: Option<f64>,
    reports: Vec<TrainingReport>,
    epochs: Vec<usize>,
    saved: Vec<PathBuf>,
    finished: bool,
}

impl ProgressSink for Recorder {
    fn training_started(&mut self, words_to_train: f64) {
        self.started = Some(words_to_train);
    }

    fn report(&mut self, report: &TrainingReport) {
        self.reports.push(report.clone());
    }

    fn epoch_finished(&mut self, epoch: usize, _finished_word_num: u64) {
        self.epochs.push(epoch);
    }

    fn checkpoint_saved(&mut self, path: &Path) {
        self.saved.push(path.to_path_buf());
    }

    fn training_finished(&mut self) {
        self.finished = true;
    }
}

#[test]
fn trains_every_epoch_and_saves_once() {
    let dir = common::two_user_dataset();
    let config = Config {
        max_train_epoch: 3,
        batch_size: 3,
        steps_per_checkpoint: 2,
        ..common::config_for(dir.path())
    };
    let data = jrl::Dataset::load(dir.path(), dir.path(), jrl::Mode::Train, 0).unwrap();
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let mut generator = BatchGenerator::new(&data, &config);
    let mut sink = Recorder::default();

    let summary = train(
        &mut model,
        &mut generator,
        &config,
        &CheckpointPolicy::from_config(&config),
        &mut sink,
    )
    .unwrap();

    // 8 words in batches of 3: three steps per epoch
    assert_eq!(summary.epochs, 3);
    assert_eq!(summary.steps, 9);
    assert_eq!(summary.global_step, 9);
    assert_eq!(model.global_step(), 9);
    assert_eq!(summary.finished_word_num, 24);
    assert_eq!(summary.non_finite_losses, 0);
    assert!(summary.last_loss.unwrap().is_finite());

    assert_eq!(sink.started, Some(25.0));
    assert_eq!(sink.epochs, vec![0, 1, 2]);
    assert_eq!(sink.reports.len(), 4);
    assert!(sink.reports.iter().all(|r| r.loss.is_finite()));
    assert!(sink.finished);

    let expected = dir.path().join("MultiViewEmbedding.ckpt-9");
    assert_eq!(sink.saved, vec![expected.clone()]);
    assert_eq!(summary.checkpoint, Some(expected.clone()));
    assert!(expected.exists());
    let index = std::fs::read_to_string(dir.path().join("checkpoint")).unwrap();
    assert_eq!(index.trim(), "MultiViewEmbedding.ckpt-9");
}

/// Reports a NaN loss on every other step and never changes.
#[derive(Default)]
struct NanEveryOtherStep {
    steps: u64,
}

impl EmbeddingModel for NanEveryOtherStep {
    fn step(&mut self, _learning_rate: f32, _batch: &Batch, mode: StepMode) -> Result<StepOutput> {
        if mode != StepMode::Train {
            bail!("only training is supported");
        }
        let loss = if self.steps % 2 == 0 { f32::NAN } else { 1.0 };
        self.steps += 1;
        Ok(StepOutput::Loss {
            loss,
            gradient_norm: 0.0,
        })
    }

    fn global_step(&self) -> u64 {
        self.steps
    }

    fn save(&self, train_dir: &Path) -> Result<PathBuf> {
        Ok(jrl::checkpoint::checkpoint_path(train_dir, self.steps))
    }
}

#[test]
fn non_finite_losses_are_counted_and_left_out_of_reports() {
    let dir = common::two_user_dataset();
    let config = Config {
        max_train_epoch: 2,
        batch_size: 3,
        steps_per_checkpoint: 2,
        ..common::config_for(dir.path())
    };
    let data = jrl::Dataset::load(dir.path(), dir.path(), jrl::Mode::Train, 0).unwrap();
    let mut model = NanEveryOtherStep::default();
    let mut generator = BatchGenerator::new(&data, &config);
    let mut sink = Recorder::default();

    let summary = train(
        &mut model,
        &mut generator,
        &config,
        &CheckpointPolicy::never(),
        &mut sink,
    )
    .unwrap();

    assert_eq!(summary.epochs, 2);
    assert_eq!(summary.steps, 6);
    assert_eq!(summary.non_finite_losses, 3);
    assert_eq!(summary.last_loss, Some(1.0));
    assert_eq!(sink.reports.len(), 3);
    // each interval holds one NaN step and one step with loss 1
    assert!(sink.reports.iter().all(|r| r.loss == 1.0));
    assert!(sink.saved.is_empty());
    assert!(sink.finished);
}

#[test]
fn a_zero_interval_saves_at_every_report() {
    let dir = common::two_user_dataset();
    let config = Config {
        max_train_epoch: 3,
        batch_size: 3,
        steps_per_checkpoint: 2,
        ..common::config_for(dir.path())
    };
    let data = jrl::Dataset::load(dir.path(), dir.path(), jrl::Mode::Train, 0).unwrap();
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let mut generator = BatchGenerator::new(&data, &config);
    let mut sink = Recorder::default();
    let policy = CheckpointPolicy {
        train_dir: Some(dir.path().to_path_buf()),
        interval: Some(Duration::ZERO),
    };

    let summary = train(&mut model, &mut generator, &config, &policy, &mut sink).unwrap();

    assert_eq!(summary.steps, 9);
    assert_eq!(sink.reports.len(), 4);
    let expected: Vec<PathBuf> = [2, 4, 6, 8, 9]
        .iter()
        .map(|step| dir.path().join(format!("MultiViewEmbedding.ckpt-{step}")))
        .collect();
    assert_eq!(sink.saved, expected);
    assert!(expected.iter().all(|path| path.exists()));
    assert_eq!(summary.checkpoint.as_ref(), expected.last());
    let index = std::fs::read_to_string(dir.path().join("checkpoint")).unwrap();
    assert_eq!(index.trim(), "MultiViewEmbedding.ckpt-9");
}

#[test]
fn a_step_lowers_the_loss_on_the_same_batch() {
    let data = common::in_memory(6, 2, 3, &[(0, 0, &[0, 1, 2, 3]), (1, 1, &[4, 5, 0, 2])]);
    let config = Config {
        embed_size: 4,
        window_size: 2,
        negative_sample: 1,
        batch_size: 8,
        subsampling_rate: 0.0,
        ..Config::default()
    };
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let mut generator = BatchGenerator::new(&data, &config);
    generator.initialize_epoch(vec![0, 1]);
    let batch = generator.get_train_batch().unwrap();

    let loss = |out: StepOutput| match out {
        StepOutput::Loss { loss, .. } => loss,
        other => panic!("expected a loss, got {other:?}"),
    };
    let first = loss(model.step(0.05, &batch, StepMode::Train).unwrap());
    let second = loss(model.step(0.05, &batch, StepMode::Train).unwrap());
    assert!(second < first, "loss went from {first} to {second}");
}

#[test]
fn gradients_are_clipped_to_the_global_norm() {
    let data = common::in_memory(6, 2, 3, &[(0, 0, &[0, 1, 2, 3]), (1, 1, &[4, 5, 0, 2])]);
    let config = Config {
        embed_size: 4,
        window_size: 2,
        negative_sample: 1,
        batch_size: 8,
        subsampling_rate: 0.0,
        max_gradient_norm: 0.01,
        ..Config::default()
    };
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let before = model.parameters().clone();
    let mut generator = BatchGenerator::new(&data, &config);
    generator.initialize_epoch(vec![0, 1]);
    let batch = generator.get_train_batch().unwrap();

    let StepOutput::Loss { gradient_norm, .. } = model.step(1.0, &batch, StepMode::Train).unwrap()
    else {
        panic!("expected a loss");
    };
    assert!(gradient_norm > 0.01);

    // with lr 1 the whole update has the clipped norm
    let after = model.parameters();
    let mut moved = 0.0f32;
    for (a, b) in [
        (&before.user, &after.user),
        (&before.product, &after.product),
        (&before.review, &after.review),
        (&before.word_in, &after.word_in),
        (&before.word_out, &after.word_out),
    ] {
        moved += (a - b).iter().map(|x| x * x).sum::<f32>();
    }
    moved += (&before.word_bias - &after.word_bias).iter().map(|x| x * x).sum::<f32>();
    moved += (&before.product_bias - &after.product_bias)
        .iter()
        .map(|x| x * x)
        .sum::<f32>();
    assert!((moved.sqrt() - 0.01).abs() < 1e-5, "update norm {}", moved.sqrt());
}

#[test]
fn forward_steps_do_not_touch_parameters() {
    let data = common::in_memory(4, 2, 2, &[(0, 0, &[0, 1]), (1, 1, &[2, 3])]);
    let config = Config {
        embed_size: 4,
        ..Config::default()
    };
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let before = model.parameters().clone();
    let batch = Batch {
        user_idxs: vec![0, 1],
        product_idxs: vec![0, 1],
        review_idxs: vec![0, 1],
        word_idxs: vec![0, 2],
        context_word_idxs: vec![vec![], vec![]],
        negative_word_idxs: vec![vec![], vec![]],
        negative_product_idxs: vec![vec![], vec![]],
        learning_rate: 0.5,
        has_next: false,
    };

    let StepOutput::Scores(scores) = model.step(0.5, &batch, StepMode::Scores).unwrap() else {
        panic!("expected scores");
    };
    assert_eq!(scores.dim(), (2, 2));
    let p = model.parameters();
    let expected = p.user.row(1).dot(&p.product.row(0));
    assert!((scores[[1, 0]] - expected).abs() < 1e-6);

    model.step(0.5, &batch, StepMode::Embeddings).unwrap();
    assert_eq!(model.parameters(), &before);
    assert_eq!(model.global_step(), 0);
}

#[test]
fn pvc_and_side_losses_train_without_trouble() {
    let dir = common::two_user_dataset();
    let config = Config {
        net_struct: jrl::NetStruct::Pvc,
        similarity_func: jrl::SimilarityFunc::Cosine,
        l2_lambda: 0.01,
        max_train_epoch: 2,
        ..common::config_for(dir.path())
    };
    let mut data = jrl::Dataset::load(dir.path(), dir.path(), jrl::Mode::Train, 0).unwrap();
    data.read_image_features(dir.path()).unwrap();
    data.read_latent_factor(dir.path()).unwrap();
    let mut model = MultiViewModel::new(&config, &data, data.review_size());
    let mut generator = BatchGenerator::new(&data, &config);
    let summary = train(
        &mut model,
        &mut generator,
        &config,
        &CheckpointPolicy::never(),
        &mut Recorder::default(),
    )
    .unwrap();
    assert_eq!(summary.steps, 2);
    assert!(summary.last_loss.unwrap().is_finite());
    assert!(summary.checkpoint.is_none());
    assert!(model.parameters().image_proj.is_some());
}

#[test]
fn self_test_runs_in_memory() {
    let config = Config {
        embed_size: 8,
        batch_size: 4,
        max_train_epoch: 3,
        subsampling_rate: 0.0,
        ..Config::default()
    };
    let summary = app::self_test(&config).unwrap();
    assert_eq!(summary.epochs, 3);
    // 23 words per epoch in batches of 4
    assert_eq!(summary.steps, 18);
    assert_eq!(summary.finished_word_num, 69);
    assert!(summary.checkpoint.is_none());
    assert_eq!(summary.non_finite_losses, 0);
}
