//! The four run modes, each wiring the dataset, batch generator, model and
//! loops together.

use anyhow::{Context, Result};
use ndarray::Array2;
use tracing::info;

use crate::batch::BatchGenerator;
use crate::config::{Config, RunMode};
use crate::dataset::{Dataset, Mode, Review};
use crate::evaluate;
use crate::model::{create_model, MultiViewModel};
use crate::progress::{LogSink, ProgressBarSink, ProgressSink};
use crate::train::{self, CheckpointPolicy, TrainSummary};

pub fn run(config: &Config) -> Result<()> {
    config.validate()?;
    match config.run_mode {
        RunMode::Train => train(config).map(|_| ()),
        RunMode::ProductScores => get_product_scores(config),
        RunMode::OutputEmbedding => output_embedding(config),
        RunMode::SelfTest => self_test(config).map(|_| ()),
    }
}

fn make_sink(config: &Config) -> Box<dyn ProgressSink> {
    if config.progress_bar {
        Box::new(ProgressBarSink::new())
    } else {
        Box::new(LogSink)
    }
}

pub fn train(config: &Config) -> Result<TrainSummary> {
    info!("Reading data in {}", config.data_dir.display());
    let mut data_set = Dataset::load(
        &config.data_dir,
        &config.input_train_dir,
        Mode::Train,
        config.max_train_data_size,
    )
    .context("error loading training data")?;
    data_set.sub_sampling(config.subsampling_rate);
    data_set.read_image_features(&config.data_dir)?;
    data_set.read_latent_factor(&config.data_dir)?;

    let mut model = create_model(config, &data_set, data_set.review_size());
    let mut generator = BatchGenerator::new(&data_set, config);
    let mut sink = make_sink(config);
    train::train(
        &mut model,
        &mut generator,
        config,
        &CheckpointPolicy::from_config(config),
        sink.as_mut(),
    )
}

/// Loads the test set with everything a forward-only model needs.
fn load_test_set(config: &Config) -> Result<Dataset> {
    let mut data_set = Dataset::load(&config.data_dir, &config.input_train_dir, Mode::Test, 0)
        .context("error loading test data")?;
    data_set.read_train_product_ids(&config.input_train_dir, config.max_train_data_size)?;
    data_set.read_image_features(&config.data_dir)?;
    data_set.read_latent_factor(&config.data_dir)?;
    Ok(data_set)
}

pub fn get_product_scores(config: &Config) -> Result<()> {
    let data_set = load_test_set(config)?;
    let mut model = create_model(config, &data_set, data_set.train_review_size);
    let mut generator = BatchGenerator::new(&data_set, config);
    evaluate::get_product_scores(&mut model, &mut generator, &data_set, config)
}

pub fn output_embedding(config: &Config) -> Result<()> {
    let data_set = load_test_set(config)?;
    let mut model = create_model(config, &data_set, data_set.train_review_size);
    let mut generator = BatchGenerator::new(&data_set, config);
    evaluate::export_embeddings(&mut model, &mut generator, &data_set, config)
}

/// The built-in dataset `self_test` trains on: three users, four products
/// with image features, six reviews over a ten-word vocabulary.
pub fn self_test_dataset() -> Result<Dataset> {
    let vocab = [
        "good", "bad", "fit", "color", "soft", "cheap", "size", "love", "return", "great",
    ];
    let reviews = [
        (0, 0, vec![0, 2, 3, 7]),
        (0, 1, vec![1, 6, 8]),
        (1, 1, vec![9, 4, 4, 7, 2]),
        (1, 2, vec![5, 1, 8]),
        (2, 3, vec![0, 9, 3, 6, 7, 2]),
        (2, 0, vec![4, 5]),
    ];
    let mut data_set = Dataset::from_parts(
        Mode::Train,
        vocab.iter().map(|w| w.to_string()).collect(),
        (0..3).map(|u| format!("user{u}")).collect(),
        (0..4).map(|p| format!("product{p}")).collect(),
        reviews
            .into_iter()
            .map(|(user, product, words)| Review {
                user,
                product,
                words,
            })
            .collect(),
    )?;
    data_set.image_features = Some(Array2::from_shape_fn((4, 3), |(p, k)| {
        if p % 3 == k {
            1.0
        } else {
            0.0
        }
    }));
    Ok(data_set)
}

/// Trains briefly on [`self_test_dataset`] with fresh parameters. Nothing
/// is written to disk.
pub fn self_test(config: &Config) -> Result<TrainSummary> {
    let mut data_set = self_test_dataset()?;
    data_set.sub_sampling(config.subsampling_rate);
    let mut model = MultiViewModel::new(config, &data_set, data_set.review_size());
    let mut generator = BatchGenerator::new(&data_set, config);
    let mut sink = make_sink(config);
    let summary = train::train(
        &mut model,
        &mut generator,
        config,
        &CheckpointPolicy::never(),
        sink.as_mut(),
    )?;
    info!(
        "Self-test passed: {} steps, last loss {:?}",
        summary.steps, summary.last_loss
    );
    Ok(summary)
}
