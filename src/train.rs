//! The epoch loop: shuffle, drain batches into the model, report, save.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::batch::BatchGenerator;
use crate::config::Config;
use crate::model::{EmbeddingModel, StepMode, StepOutput};
use crate::progress::{ProgressSink, TrainingReport};

/// When and where the loop writes checkpoints.
#[derive(Clone, Debug, Default)]
pub struct CheckpointPolicy {
    /// `None` means never write one.
    pub train_dir: Option<PathBuf>,
    /// Also save at report points once this much time has passed since the
    /// last save.
    pub interval: Option<Duration>,
}

impl CheckpointPolicy {
    pub fn from_config(config: &Config) -> Self {
        CheckpointPolicy {
            train_dir: Some(config.train_dir.clone()),
            interval: config.checkpoint_interval(),
        }
    }

    pub fn never() -> Self {
        CheckpointPolicy::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainSummary {
    pub epochs: usize,
    /// Steps taken by this run.
    pub steps: u64,
    pub global_step: u64,
    pub finished_word_num: u64,
    /// Loss of the last step with a finite loss.
    pub last_loss: Option<f32>,
    pub non_finite_losses: u64,
    /// The checkpoint written at the end, if any.
    pub checkpoint: Option<PathBuf>,
}

/// Accumulators for one reporting interval.
struct Interval {
    steps: usize,
    finite_steps: usize,
    loss_sum: f32,
    prepare_time: Duration,
    step_time: Duration,
    started: Instant,
    words_at_start: u64,
}

impl Interval {
    fn new(words_at_start: u64) -> Self {
        Interval {
            steps: 0,
            finite_steps: 0,
            loss_sum: 0.0,
            prepare_time: Duration::ZERO,
            step_time: Duration::ZERO,
            started: Instant::now(),
            words_at_start,
        }
    }

    fn mean_loss(&self) -> f32 {
        if self.finite_steps == 0 {
            f32::NAN
        } else {
            self.loss_sum / self.finite_steps as f32
        }
    }
}

pub fn train<M: EmbeddingModel + ?Sized>(
    model: &mut M,
    generator: &mut BatchGenerator<'_>,
    config: &Config,
    policy: &CheckpointPolicy,
    sink: &mut dyn ProgressSink,
) -> Result<TrainSummary> {
    if config.learning_rate_decay_factor != 1.0 {
        debug!(
            "learning_rate_decay_factor {} is ignored; the rate follows word progress",
            config.learning_rate_decay_factor
        );
    }

    let mut summary = TrainSummary::default();
    let mut training_seq: Vec<usize> = (0..generator.review_size()).collect();
    let mut interval = Interval::new(0);
    let mut last_save = Instant::now();
    let mut current_epoch = 0;

    sink.training_started(generator.words_to_train());
    while current_epoch < config.max_train_epoch {
        generator.shuffle(&mut training_seq);
        generator.initialize_epoch(training_seq.clone());

        let mut has_next = true;
        while has_next {
            let t = Instant::now();
            let batch = generator.get_train_batch()?;
            interval.prepare_time += t.elapsed();
            has_next = batch.has_next;
            if batch.is_empty() {
                continue;
            }

            let t = Instant::now();
            let StepOutput::Loss { loss, .. } =
                model.step(batch.learning_rate, &batch, StepMode::Train)?
            else {
                bail!("training step returned no loss");
            };
            interval.step_time += t.elapsed();
            summary.steps += 1;
            interval.steps += 1;
            if loss.is_finite() {
                interval.loss_sum += loss;
                interval.finite_steps += 1;
                summary.last_loss = Some(loss);
            } else {
                warn!("non-finite loss {loss} at step {}", model.global_step());
                summary.non_finite_losses += 1;
            }

            if interval.steps == config.steps_per_checkpoint {
                let finished = generator.finished_word_num();
                let elapsed = interval.started.elapsed().as_secs_f64();
                let words = finished - interval.words_at_start;
                sink.report(&TrainingReport {
                    epoch: current_epoch,
                    global_step: model.global_step(),
                    finished_word_num: finished,
                    words_to_train: generator.words_to_train(),
                    learning_rate: batch.learning_rate,
                    loss: interval.mean_loss(),
                    words_per_sec: if elapsed > 0.0 { words as f64 / elapsed } else { 0.0 },
                    prepare_time: interval.prepare_time,
                    step_time: interval.step_time,
                });

                if let (Some(dir), Some(every)) = (&policy.train_dir, policy.interval) {
                    if last_save.elapsed() >= every {
                        let path = model.save(dir)?;
                        sink.checkpoint_saved(&path);
                        last_save = Instant::now();
                    }
                }
                interval = Interval::new(finished);
            }
        }

        sink.epoch_finished(current_epoch, generator.finished_word_num());
        current_epoch += 1;
    }

    if let Some(dir) = &policy.train_dir {
        let path = model.save(dir)?;
        sink.checkpoint_saved(&path);
        summary.checkpoint = Some(path);
    }
    sink.training_finished();

    summary.epochs = current_epoch;
    summary.global_step = model.global_step();
    summary.finished_word_num = generator.finished_word_num();
    info!(
        "Finished {} epochs: {} steps, {} words",
        summary.epochs, summary.steps, summary.finished_word_num
    );
    Ok(summary)
}
