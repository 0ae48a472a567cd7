//! Command-line options and the immutable run configuration built from them.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{Parser, ValueEnum};

/// How user and product vectors are compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SimilarityFunc {
    /// Plain dot product.
    Product,
    /// Dot product plus a learned per-product bias.
    #[value(name = "bias_product")]
    BiasProduct,
    Cosine,
}

impl fmt::Display for SimilarityFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SimilarityFunc::Product => "product",
            SimilarityFunc::BiasProduct => "bias_product",
            SimilarityFunc::Cosine => "cosine",
        })
    }
}

/// Which views predict the words of a review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NetStruct {
    /// Review, user and product vectors each predict the target word.
    Pv,
    /// Like `Pv`, but the review view also averages in its context words.
    Pvc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TestMode {
    #[value(name = "product_scores")]
    ProductScores,
    #[value(name = "output_embedding")]
    OutputEmbedding,
}

/// What the process does, resolved once from `--decode`, `--test-mode`
/// and `--self-test`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Train,
    ProductScores,
    OutputEmbedding,
    SelfTest,
}

#[derive(Parser, Debug, Clone)]
#[command(
    about = "Train and evaluate joint user/product/review/word embeddings",
    long_about = None
)]
pub struct Options {
    /// Learning rate.
    #[arg(long, default_value_t = 0.05)]
    pub learning_rate: f32,

    /// Learning rate decays by this much. Accepted for compatibility; the
    /// word-progress schedule does not use it.
    #[arg(long, default_value_t = 0.90)]
    pub learning_rate_decay_factor: f32,

    /// Clip gradients to this global norm.
    #[arg(long, default_value_t = 5.0)]
    pub max_gradient_norm: f32,

    /// Threshold for word subsampling; words more frequent than this are
    /// randomly discarded. 0 disables subsampling.
    #[arg(long, default_value_t = 1e-4)]
    pub subsampling_rate: f64,

    /// Lambda for L2 regularization.
    #[arg(long = "l2-lambda", default_value_t = 0.0)]
    pub l2_lambda: f32,

    /// Weight for the image feature loss.
    #[arg(long, default_value_t = 1.0)]
    pub image_weight: f32,

    /// Weight for the latent rating factor loss.
    #[arg(long, default_value_t = 1.0)]
    pub latent_weight: f32,

    /// Batch size to use during training.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Data directory.
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub data_dir: PathBuf,

    /// The directory of training and testing data; defaults to --data-dir.
    #[arg(long, value_name = "DIR")]
    pub input_train_dir: Option<PathBuf>,

    /// Model directory & output directory.
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub train_dir: PathBuf,

    /// Similarity function between users and products.
    #[arg(long, value_enum, default_value_t = SimilarityFunc::Product)]
    pub similarity_func: SimilarityFunc,

    /// Network structure.
    #[arg(long, value_enum, default_value_t = NetStruct::Pv)]
    pub net_struct: NetStruct,

    /// Size of each embedding.
    #[arg(long, default_value_t = 100)]
    pub embed_size: usize,

    /// Size of context window.
    #[arg(long, default_value_t = 5)]
    pub window_size: usize,

    /// Limit on the number of training reviews (0: no limit).
    #[arg(long, default_value_t = 0)]
    pub max_train_data_size: usize,

    /// Number of training epochs.
    #[arg(long, default_value_t = 5)]
    pub max_train_epoch: usize,

    /// How many training steps between progress reports.
    #[arg(long, default_value_t = 200)]
    pub steps_per_checkpoint: usize,

    /// Minimum seconds between periodic checkpoints.
    #[arg(long, default_value_t = 3600)]
    pub seconds_per_checkpoint: u64,

    /// Also write checkpoints during training, every --seconds-per-checkpoint.
    #[arg(long)]
    pub periodic_checkpoints: bool,

    /// How many negative samples to draw per target.
    #[arg(long, default_value_t = 5)]
    pub negative_sample: usize,

    /// Evaluate a trained model instead of training.
    #[arg(long)]
    pub decode: bool,

    /// What --decode produces.
    #[arg(long, value_enum, default_value_t = TestMode::ProductScores)]
    pub test_mode: TestMode,

    /// Rank cutoff for output ranklists.
    #[arg(long, default_value_t = 100)]
    pub rank_cutoff: usize,

    /// Train briefly on a small built-in dataset.
    #[arg(long)]
    pub self_test: bool,

    /// Seed for shuffling and sampling. Parameter initialization uses seed + 1.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Show a progress bar instead of periodic log lines.
    #[arg(long)]
    pub progress_bar: bool,
}

/// Everything a run needs to know, fixed at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub learning_rate: f32,
    pub learning_rate_decay_factor: f32,
    pub max_gradient_norm: f32,
    pub subsampling_rate: f64,
    pub l2_lambda: f32,
    pub image_weight: f32,
    pub latent_weight: f32,
    pub batch_size: usize,
    pub data_dir: PathBuf,
    pub input_train_dir: PathBuf,
    pub train_dir: PathBuf,
    pub similarity_func: SimilarityFunc,
    pub net_struct: NetStruct,
    pub embed_size: usize,
    pub window_size: usize,
    pub max_train_data_size: usize,
    pub max_train_epoch: usize,
    pub steps_per_checkpoint: usize,
    pub seconds_per_checkpoint: u64,
    pub periodic_checkpoints: bool,
    pub negative_sample: usize,
    pub run_mode: RunMode,
    pub rank_cutoff: usize,
    pub seed: u64,
    pub progress_bar: bool,
}

impl From<Options> for Config {
    fn from(options: Options) -> Self {
        let run_mode = if options.self_test {
            RunMode::SelfTest
        } else if options.decode {
            match options.test_mode {
                TestMode::ProductScores => RunMode::ProductScores,
                TestMode::OutputEmbedding => RunMode::OutputEmbedding,
            }
        } else {
            RunMode::Train
        };

        let input_train_dir = match options.input_train_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => options.data_dir.clone(),
        };

        Config {
            learning_rate: options.learning_rate,
            learning_rate_decay_factor: options.learning_rate_decay_factor,
            max_gradient_norm: options.max_gradient_norm,
            subsampling_rate: options.subsampling_rate,
            l2_lambda: options.l2_lambda,
            image_weight: options.image_weight,
            latent_weight: options.latent_weight,
            batch_size: options.batch_size,
            data_dir: options.data_dir,
            input_train_dir,
            train_dir: options.train_dir,
            similarity_func: options.similarity_func,
            net_struct: options.net_struct,
            embed_size: options.embed_size,
            window_size: options.window_size,
            max_train_data_size: options.max_train_data_size,
            max_train_epoch: options.max_train_epoch,
            steps_per_checkpoint: options.steps_per_checkpoint,
            seconds_per_checkpoint: options.seconds_per_checkpoint,
            periodic_checkpoints: options.periodic_checkpoints,
            negative_sample: options.negative_sample,
            run_mode,
            rank_cutoff: options.rank_cutoff,
            seed: options.seed,
            progress_bar: options.progress_bar,
        }
    }
}

impl Default for Config {
    /// The command-line defaults.
    fn default() -> Self {
        Options::parse_from(["jrl"]).into()
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "--batch-size must be positive");
        ensure!(self.window_size > 0, "--window-size must be positive");
        ensure!(self.embed_size > 0, "--embed-size must be positive");
        ensure!(self.max_train_epoch > 0, "--max-train-epoch must be at least 1");
        ensure!(
            self.steps_per_checkpoint > 0,
            "--steps-per-checkpoint must be positive"
        );
        ensure!(self.rank_cutoff > 0, "--rank-cutoff must be positive");
        ensure!(
            self.subsampling_rate >= 0.0,
            "--subsampling-rate must not be negative"
        );
        ensure!(
            self.max_gradient_norm > 0.0,
            "--max-gradient-norm must be positive"
        );
        ensure!(self.learning_rate > 0.0, "--learning-rate must be positive");
        Ok(())
    }

    /// `None` unless periodic checkpoints were asked for.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.periodic_checkpoints
            .then(|| Duration::from_secs(self.seconds_per_checkpoint))
    }
}
