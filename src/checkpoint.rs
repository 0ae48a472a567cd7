//! Saving and restoring model parameters.
//!
//! A checkpoint is a bincode file `MultiViewEmbedding.ckpt-{step}` in the
//! train directory. A small text file named `checkpoint` next to it holds the
//! file name of the most recent one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Parameters;

pub const MODEL_NAME: &str = "MultiViewEmbedding";
const INDEX_FILE: &str = "checkpoint";

#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub global_step: u64,
    pub params: Parameters,
}

/// Same layout as `Checkpoint`, without taking ownership of the parameters.
#[derive(Serialize)]
struct CheckpointRef<'a> {
    global_step: u64,
    params: &'a Parameters,
}

pub fn checkpoint_path(train_dir: &Path, global_step: u64) -> PathBuf {
    train_dir.join(format!("{MODEL_NAME}.ckpt-{global_step}"))
}

/// Writes a checkpoint and points the index at it.
pub fn save(train_dir: &Path, global_step: u64, params: &Parameters) -> Result<PathBuf> {
    fs::create_dir_all(train_dir)
        .with_context(|| format!("error creating {}", train_dir.display()))?;
    let path = checkpoint_path(train_dir, global_step);
    let fo = BufWriter::new(
        File::create(&path).with_context(|| format!("error creating {}", path.display()))?,
    );
    bincode::serialize_into(fo, &CheckpointRef { global_step, params })
        .with_context(|| format!("error writing {}", path.display()))?;

    let name = format!("{MODEL_NAME}.ckpt-{global_step}\n");
    fs::write(train_dir.join(INDEX_FILE), name).context("error writing checkpoint index")?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<Checkpoint> {
    let fi = BufReader::new(
        File::open(path).with_context(|| format!("error opening {}", path.display()))?,
    );
    bincode::deserialize_from(fi).with_context(|| format!("error reading {}", path.display()))
}

/// The checkpoint the index points at, if there is an index.
pub fn latest(train_dir: &Path) -> Result<Option<PathBuf>> {
    let index = train_dir.join(INDEX_FILE);
    match fs::read_to_string(&index) {
        Ok(text) => {
            let name = text.trim();
            if name.is_empty() {
                return Ok(None);
            }
            Ok(Some(train_dir.join(name)))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("error reading {}", index.display())),
    }
}

pub fn restore_latest(train_dir: &Path) -> Result<Option<(PathBuf, Checkpoint)>> {
    match latest(train_dir)? {
        Some(path) => {
            let checkpoint = load(&path)?;
            Ok(Some((path, checkpoint)))
        }
        None => Ok(None),
    }
}
