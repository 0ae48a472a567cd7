use std::path::PathBuf;

use thiserror::Error;

/// Problems with the input data. All of these are fatal to the run.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("required data file {0:?} does not exist")]
    MissingFile(PathBuf),

    #[error("{path:?} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{kind} index {index} out of range (only {size} known)")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        size: usize,
    },

    /// A side-feature file has no row for an entity we need.
    #[error("no {kind} feature row for id {key:?}")]
    MissingKey { kind: &'static str, key: String },

    #[error("{path:?}: expected {expected} values per row, found {found}")]
    DimensionMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("dataset has no {0}")]
    EmptyDataset(&'static str),

    #[error("epoch already exhausted; call initialize_epoch to start another")]
    EpochExhausted,
}
