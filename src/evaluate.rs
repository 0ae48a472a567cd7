//! Forward-only passes over the test set: product ranking and embedding
//! export.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, info};

use crate::batch::BatchGenerator;
use crate::config::Config;
use crate::dataset::Dataset;
use crate::model::{EmbeddingModel, StepMode, StepOutput};
use crate::ranklist::{self, Ranklist};

/// Scores every product for each test user. The first test tuple for a user
/// determines that user's ranklist.
pub fn rank_products<M: EmbeddingModel + ?Sized>(
    model: &mut M,
    generator: &mut BatchGenerator<'_>,
    data_set: &Dataset,
    config: &Config,
) -> Result<BTreeMap<usize, Ranklist>> {
    generator.initialize_epoch((0..generator.review_size()).collect());
    let mut ranklists = BTreeMap::new();
    let mut steps = 0;
    let mut has_next = true;
    while has_next {
        let batch = generator.get_test_batch()?;
        has_next = batch.has_next;
        if batch.is_empty() {
            continue;
        }
        let StepOutput::Scores(scores) =
            model.step(batch.learning_rate, &batch, StepMode::Scores)?
        else {
            bail!("scoring step returned no scores");
        };
        for (i, &user) in batch.user_idxs.iter().enumerate() {
            if ranklists.contains_key(&user) {
                continue;
            }
            let row = scores.row(i);
            let sorted = ranklist::sort_by_score(row);
            let list =
                data_set.compute_test_product_ranklist(user, row, &sorted, config.rank_cutoff);
            ranklists.insert(user, list);
        }

        steps += 1;
        if steps % config.steps_per_checkpoint == 0 {
            debug!(
                "Finish test review {}/{}",
                generator.cursor().review_i,
                generator.review_size()
            );
        }
    }
    Ok(ranklists)
}

/// Ranks products for every test user and writes the ranklist file.
pub fn get_product_scores<M: EmbeddingModel + ?Sized>(
    model: &mut M,
    generator: &mut BatchGenerator<'_>,
    data_set: &Dataset,
    config: &Config,
) -> Result<()> {
    let ranklists = rank_products(model, generator, data_set, config)?;
    data_set.output_ranklist(&ranklists, &config.train_dir, config.similarity_func)?;
    info!(
        "Wrote ranklists for {} users to {}",
        ranklists.len(),
        ranklist::ranklist_path(&config.train_dir, config.similarity_func).display()
    );
    Ok(())
}

/// Writes the user and product tables to `user_emb.txt` and
/// `product_emb.txt` in the train directory.
pub fn export_embeddings<M: EmbeddingModel + ?Sized>(
    model: &mut M,
    generator: &mut BatchGenerator<'_>,
    data_set: &Dataset,
    config: &Config,
) -> Result<()> {
    generator.initialize_epoch((0..generator.review_size()).collect());
    let batch = generator.get_test_batch()?;
    ensure!(!batch.is_empty(), "no test data to export embeddings with");

    let StepOutput::Embeddings { users, products } =
        model.step(batch.learning_rate, &batch, StepMode::Embeddings)?
    else {
        bail!("embedding step returned no embeddings");
    };

    std::fs::create_dir_all(&config.train_dir)
        .with_context(|| format!("error creating {}", config.train_dir.display()))?;
    let user_path = config.train_dir.join("user_emb.txt");
    let product_path = config.train_dir.join("product_emb.txt");
    Dataset::output_embedding(users.view(), &data_set.user_ids, &user_path)?;
    Dataset::output_embedding(products.view(), &data_set.product_ids, &product_path)?;
    info!(
        "Wrote {} user and {} product embeddings to {}",
        users.nrows(),
        products.nrows(),
        config.train_dir.display()
    );
    Ok(())
}
