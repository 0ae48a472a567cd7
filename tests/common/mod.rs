//! Tiny on-disk datasets for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use jrl::{Config, Dataset, Mode, Review};

pub fn write_file(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

/// Two users, three products, one four-word review per user in training.
pub fn two_user_dataset() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let d = dir.path();
    write_file(d, "vocab.txt", "good\nfit\nsoft\ncheap\nbad\nsize\n");
    write_file(d, "users.txt", "alice\nbob\n");
    write_file(d, "product.txt", "hat\nscarf\nglove\n");
    write_file(d, "train.txt", "0\t0\t0 1 2 3\n1\t1\t4 5 0 2\n");
    write_file(d, "test.txt", "0\t2\t1 2\n1\t0\t3\n0\t1\t5\n");
    write_file(
        d,
        "product_image_feature.txt",
        "hat 1 0\nscarf 0 1\nglove 0.5 0.5\n",
    );
    write_file(d, "user_latent_factors.txt", "alice 0.1 0.2 0.3\nbob 0.3 0.2 0.1\n");
    write_file(d, "product_latent_factors.txt", "hat 1 0 0\nscarf 0 1 0\nglove 0 0 1\n");
    dir
}

/// Defaults with small tables, pointed at `data_dir` for both input and
/// output.
pub fn config_for(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        input_train_dir: data_dir.to_path_buf(),
        train_dir: data_dir.to_path_buf(),
        embed_size: 8,
        window_size: 2,
        negative_sample: 1,
        batch_size: 8,
        subsampling_rate: 0.0,
        max_train_epoch: 1,
        steps_per_checkpoint: 1,
        ..Config::default()
    }
}

/// An in-memory training set of `reviews` over a vocabulary of `vocab_size`.
pub fn in_memory(
    vocab_size: usize,
    users: usize,
    products: usize,
    reviews: &[(usize, usize, &[usize])],
) -> Dataset {
    Dataset::from_parts(
        Mode::Train,
        (0..vocab_size).map(|w| format!("w{w}")).collect(),
        (0..users).map(|u| format!("u{u}")).collect(),
        (0..products).map(|p| format!("p{p}")).collect(),
        reviews
            .iter()
            .map(|&(user, product, words)| Review {
                user,
                product,
                words: words.to_vec(),
            })
            .collect(),
    )
    .unwrap()
}
