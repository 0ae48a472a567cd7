//! Joint representation learning for users, products, reviews and words.
//!
//! The pieces, leaves first: [`dataset`] loads interaction records and
//! frequency distributions, [`batch`] turns them into mini-batches with
//! negative samples, [`model`] owns the parameters and runs one step per
//! batch, and [`train`] / [`evaluate`] drive the model over whole epochs.

pub mod app;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod embeddings;
pub mod error;
pub mod evaluate;
pub mod model;
pub mod progress;
pub mod ranklist;
pub mod sampling;
pub mod train;

pub use batch::{Batch, BatchGenerator, CursorState, EpochCursor};
pub use config::{Config, NetStruct, Options, RunMode, SimilarityFunc, TestMode};
pub use dataset::{Dataset, Mode, Review};
pub use error::DataError;
pub use model::{EmbeddingModel, MultiViewModel, StepMode, StepOutput};
