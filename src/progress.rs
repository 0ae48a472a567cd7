//! Where training progress goes. The training loop calls a [`ProgressSink`]
//! and never decides anything based on what the sink does.

use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Statistics for one reporting interval.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingReport {
    pub epoch: usize,
    pub global_step: u64,
    pub finished_word_num: u64,
    pub words_to_train: f64,
    pub learning_rate: f32,
    /// Mean loss over the interval's steps.
    pub loss: f32,
    pub words_per_sec: f64,
    pub prepare_time: Duration,
    pub step_time: Duration,
}

impl TrainingReport {
    /// Fraction of the run's words handed out so far, as a percentage.
    pub fn percent_done(&self) -> f64 {
        100.0 * self.finished_word_num as f64 / self.words_to_train
    }
}

pub trait ProgressSink {
    fn training_started(&mut self, _words_to_train: f64) {}
    fn report(&mut self, report: &TrainingReport);
    fn epoch_finished(&mut self, _epoch: usize, _finished_word_num: u64) {}
    fn checkpoint_saved(&mut self, _path: &Path) {}
    fn training_finished(&mut self) {}
}

/// Reports through `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn training_started(&mut self, words_to_train: f64) {
        info!("Training on {words_to_train:.0} words");
    }

    fn report(&mut self, r: &TrainingReport) {
        info!(
            "Epoch {} Words {}/{:.0} ({:.2}%) step {} lr {:.5} loss {:.4} words/sec {:.0} prepare {:.2?} step {:.2?}",
            r.epoch,
            r.finished_word_num,
            r.words_to_train,
            r.percent_done(),
            r.global_step,
            r.learning_rate,
            r.loss,
            r.words_per_sec,
            r.prepare_time,
            r.step_time,
        );
    }

    fn epoch_finished(&mut self, epoch: usize, finished_word_num: u64) {
        info!("Epoch {epoch} finished, {finished_word_num} words so far");
    }

    fn checkpoint_saved(&mut self, path: &Path) {
        info!("Saved checkpoint {}", path.display());
    }
}

/// Draws a progress bar over words trained.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% eta {eta} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = ProgressBar::new(0);
        bar.set_style(style);
        ProgressBarSink { bar }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn training_started(&mut self, words_to_train: f64) {
        self.bar.set_length(words_to_train as u64);
    }

    fn report(&mut self, r: &TrainingReport) {
        self.bar.set_position(r.finished_word_num);
        self.bar.set_message(format!(
            "epoch {} lr {:.5} loss {:.4} {:.0} words/s",
            r.epoch, r.learning_rate, r.loss, r.words_per_sec
        ));
    }

    fn checkpoint_saved(&mut self, path: &Path) {
        self.bar.println(format!("saved {}", path.display()));
    }

    fn training_finished(&mut self) {
        self.bar.finish();
    }
}
