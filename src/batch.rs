//! Mini-batch generation: a cursor over a shuffled review order that expands
//! reviews into (target word, context window) tuples with negative samples.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::DataError;
use crate::sampling::UnigramTable;

/// Learning rate never drops below this fraction of the starting rate.
const MIN_LEARNING_RATE_FRACTION: f64 = 0.0001;

/// One mini-batch. Column `i` of every `Vec` describes tuple `i`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub user_idxs: Vec<usize>,
    pub product_idxs: Vec<usize>,
    pub review_idxs: Vec<usize>,
    pub word_idxs: Vec<usize>,
    /// Words around the target, truncated at the review boundaries.
    pub context_word_idxs: Vec<Vec<usize>>,
    pub negative_word_idxs: Vec<Vec<usize>>,
    pub negative_product_idxs: Vec<Vec<usize>>,
    pub learning_rate: f32,
    /// False exactly once per epoch, on the batch that finishes it.
    pub has_next: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.word_idxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_idxs.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorState {
    /// `initialize_epoch` just ran.
    EpochStart,
    /// Positioned at the first word of a new review.
    ScanningReview,
    /// Part way through a review.
    WithinWindow,
    /// Every word of the current review has been visited.
    ReviewDone,
    /// The batch with `has_next == false` has been handed out.
    EpochDone,
}

/// Where an epoch is. Only moves forward; `initialize_epoch` replaces it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochCursor {
    /// Review indices in the order this epoch visits them.
    pub order: Vec<usize>,
    /// Position in `order`.
    pub review_i: usize,
    /// Position within the current review's words.
    pub word_i: usize,
    /// Tuples emitted so far this epoch.
    pub words_emitted: u64,
    /// Time spent building batches this epoch.
    pub prepare_time: Duration,
    pub state: CursorState,
}

impl EpochCursor {
    pub fn new(order: Vec<usize>) -> Self {
        EpochCursor {
            order,
            review_i: 0,
            word_i: 0,
            words_emitted: 0,
            prepare_time: Duration::ZERO,
            state: CursorState::EpochStart,
        }
    }

    /// A cursor that refuses to produce batches until an epoch starts.
    fn finished() -> Self {
        EpochCursor {
            state: CursorState::EpochDone,
            ..EpochCursor::new(vec![])
        }
    }

    pub fn current_review(&self) -> Option<usize> {
        self.order.get(self.review_i).copied()
    }

    /// True once every review in `order` has been passed.
    pub fn is_exhausted(&self) -> bool {
        self.review_i >= self.order.len()
    }

    fn next_review(&mut self) {
        self.review_i += 1;
        self.word_i = 0;
        self.state = CursorState::ScanningReview;
    }
}

pub struct BatchGenerator<'a> {
    data_set: &'a Dataset,
    batch_size: usize,
    window_size: usize,
    negative_sample: usize,
    base_learning_rate: f32,
    words_to_train: f64,
    finished_word_num: u64,
    word_table: UnigramTable,
    product_table: UnigramTable,
    rng: StdRng,
    cursor: EpochCursor,
}

impl<'a> BatchGenerator<'a> {
    /// The generator owns the process-wide random number generator, seeded
    /// from `config.seed`, used for shuffling, subsampling and negative
    /// sampling.
    pub fn new(data_set: &'a Dataset, config: &Config) -> Self {
        BatchGenerator {
            data_set,
            batch_size: config.batch_size,
            window_size: config.window_size,
            negative_sample: config.negative_sample,
            base_learning_rate: config.learning_rate,
            words_to_train: config.max_train_epoch as f64 * data_set.word_count + 1.0,
            finished_word_num: 0,
            word_table: UnigramTable::new(&data_set.vocab_distribute),
            product_table: UnigramTable::new(&data_set.product_distribute),
            rng: StdRng::seed_from_u64(config.seed),
            cursor: EpochCursor::finished(),
        }
    }

    pub fn review_size(&self) -> usize {
        self.data_set.review_size()
    }

    pub fn words_to_train(&self) -> f64 {
        self.words_to_train
    }

    /// Target words handed out over the whole run.
    pub fn finished_word_num(&self) -> u64 {
        self.finished_word_num
    }

    pub fn cursor(&self) -> &EpochCursor {
        &self.cursor
    }

    /// Replaces the cursor, e.g. with one captured earlier.
    pub fn set_cursor(&mut self, cursor: EpochCursor) {
        self.cursor = cursor;
    }

    pub fn shuffle(&mut self, order: &mut [usize]) {
        order.shuffle(&mut self.rng);
    }

    pub fn initialize_epoch(&mut self, order: Vec<usize>) {
        self.cursor = EpochCursor::new(order);
    }

    /// `base_lr * (1 - finished / words_to_train)`, floored at a small
    /// fraction of `base_lr`.
    pub fn learning_rate(&self) -> f32 {
        let progress = 1.0 - self.finished_word_num as f64 / self.words_to_train;
        (self.base_learning_rate as f64 * progress.max(MIN_LEARNING_RATE_FRACTION)) as f32
    }

    fn start_batch(&self) -> Result<Batch, DataError> {
        if self.cursor.state == CursorState::EpochDone {
            return Err(DataError::EpochExhausted);
        }
        Ok(Batch {
            learning_rate: self.learning_rate(),
            ..Batch::default()
        })
    }

    /// Moves past finished and empty reviews so exhaustion is visible as
    /// soon as the last word has been consumed.
    fn skip_finished_reviews(&mut self) {
        let data_set = self.data_set;
        while let Some(r) = self.cursor.current_review() {
            if self.cursor.word_i < data_set.reviews[r].words.len() {
                break;
            }
            self.cursor.next_review();
        }
    }

    fn finish_batch(&mut self, batch: &mut Batch, started: Instant) {
        batch.has_next = !(self.cursor.is_exhausted() && batch.len() < self.batch_size);
        if !batch.has_next {
            self.cursor.state = CursorState::EpochDone;
        }
        self.cursor.prepare_time += started.elapsed();
    }

    /// Next batch of training tuples, one per kept target word.
    pub fn get_train_batch(&mut self) -> Result<Batch, DataError> {
        let started = Instant::now();
        let mut batch = self.start_batch()?;
        let data_set = self.data_set;
        let reviews = &data_set.reviews;

        while batch.len() < self.batch_size {
            let Some(review_idx) = self.cursor.current_review() else {
                break;
            };
            let review = &reviews[review_idx];
            if self.cursor.word_i >= review.words.len() {
                self.cursor.next_review();
                continue;
            }

            self.cursor.state = CursorState::WithinWindow;
            let pos = self.cursor.word_i;
            let word = review.words[pos];
            if self.rng.gen::<f64>() < data_set.keep_probability(word) {
                let start = pos.saturating_sub(self.window_size);
                let stop = (pos + self.window_size + 1).min(review.words.len());
                let context: Vec<usize> = (start..stop)
                    .filter(|&c| c != pos)
                    .map(|c| review.words[c])
                    .collect();
                let negative_words =
                    self.word_table
                        .sample_distinct(&mut self.rng, self.negative_sample, |id| {
                            id == word || context.contains(&id)
                        });
                let negative_products = self.product_table.sample_distinct(
                    &mut self.rng,
                    self.negative_sample,
                    |id| id == review.product,
                );

                batch.user_idxs.push(review.user);
                batch.product_idxs.push(review.product);
                batch.review_idxs.push(review_idx);
                batch.word_idxs.push(word);
                batch.context_word_idxs.push(context);
                batch.negative_word_idxs.push(negative_words);
                batch.negative_product_idxs.push(negative_products);
                self.cursor.words_emitted += 1;
                self.finished_word_num += 1;
            }

            self.cursor.word_i += 1;
            if self.cursor.word_i == review.words.len() {
                self.cursor.state = CursorState::ReviewDone;
            }
        }

        self.skip_finished_reviews();
        self.finish_batch(&mut batch, started);
        Ok(batch)
    }

    /// Next batch of test tuples, one per review, for scoring users.
    pub fn get_test_batch(&mut self) -> Result<Batch, DataError> {
        let started = Instant::now();
        let mut batch = self.start_batch()?;
        let data_set = self.data_set;

        while batch.len() < self.batch_size {
            let Some(review_idx) = self.cursor.current_review() else {
                break;
            };
            let review = &data_set.reviews[review_idx];
            batch.user_idxs.push(review.user);
            batch.product_idxs.push(review.product);
            batch.review_idxs.push(review_idx);
            batch.word_idxs.push(review.words.first().copied().unwrap_or(0));
            batch.context_word_idxs.push(vec![]);
            batch.negative_word_idxs.push(vec![]);
            batch.negative_product_idxs.push(vec![]);
            self.cursor.words_emitted += 1;
            self.cursor.next_review();
        }

        self.finish_batch(&mut batch, started);
        Ok(batch)
    }
}
