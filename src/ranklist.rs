//! Per-user product rankings and their TREC-style text output.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::ArrayView1;
use ordered_float::OrderedFloat;

use crate::checkpoint::MODEL_NAME;
use crate::config::SimilarityFunc;
use crate::dataset::Dataset;

/// `(product index, score)` pairs, best first.
pub type Ranklist = Vec<(usize, f32)>;

/// Indices of `scores` from highest to lowest. Equal scores keep their
/// index order.
pub fn sort_by_score(scores: ArrayView1<'_, f32>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by_key(|&i| Reverse(OrderedFloat(scores[i])));
    order
}

pub fn ranklist_path(train_dir: &Path, similarity: SimilarityFunc) -> PathBuf {
    train_dir.join(format!("test.{similarity}.ranklist"))
}

impl Dataset {
    /// The top `cutoff` products for `user_idx`, walking `sorted_indices`
    /// in order. Products the user reviewed in training are skipped when
    /// those were loaded with `read_train_product_ids`.
    pub fn compute_test_product_ranklist(
        &self,
        user_idx: usize,
        scores: ArrayView1<'_, f32>,
        sorted_indices: &[usize],
        cutoff: usize,
    ) -> Ranklist {
        let seen = self
            .user_train_products
            .as_ref()
            .and_then(|sets| sets.get(user_idx));
        sorted_indices
            .iter()
            .copied()
            .filter(|p| !seen.map_or(false, |s| s.contains(p)))
            .take(cutoff)
            .map(|p| (p, scores[p]))
            .collect()
    }

    /// Writes every user's ranklist to `{train_dir}/test.{similarity}.ranklist`,
    /// users in index order, as `user Q0 product rank score name` lines.
    pub fn output_ranklist(
        &self,
        ranklists: &BTreeMap<usize, Ranklist>,
        train_dir: &Path,
        similarity: SimilarityFunc,
    ) -> Result<()> {
        fs::create_dir_all(train_dir)
            .with_context(|| format!("error creating {}", train_dir.display()))?;
        let path = ranklist_path(train_dir, similarity);
        let mut fo = BufWriter::new(
            File::create(&path).with_context(|| format!("error creating {}", path.display()))?,
        );
        for (&user, list) in ranklists {
            let user_id = &self.user_ids[user];
            for (rank, &(product, score)) in list.iter().enumerate() {
                writeln!(
                    fo,
                    "{user_id} Q0 {} {} {score} {MODEL_NAME}",
                    self.product_ids[product],
                    rank + 1
                )
                .context("error writing ranklist")?;
            }
        }
        fo.flush().context("error writing ranklist")?;
        Ok(())
    }
}
