//! The embedding model: parameters plus a single `step` operation.
//!
//! Training minimizes, per tuple, a negative-sampling word loss for each
//! of the review, user and product views, a negative-sampling
//! user-to-product loss, squared-error losses tying product/user vectors to
//! projected image features and latent rating factors, and L2 penalties.
//! Gradients are accumulated sparsely for the rows a batch touches, clipped
//! by their global norm, and applied with plain SGD.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::Batch;
use crate::checkpoint;
use crate::config::{Config, NetStruct, SimilarityFunc};
use crate::dataset::Dataset;

/// What a call to [`EmbeddingModel::step`] should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    /// Compute the loss and apply one gradient update.
    Train,
    /// Forward only: score every product for each tuple's user.
    Scores,
    /// Forward only: hand back the user and product tables.
    Embeddings,
}

#[derive(Clone, Debug)]
pub enum StepOutput {
    /// Mean batch loss, plus the global gradient norm before clipping.
    Loss { loss: f32, gradient_norm: f32 },
    /// `scores[[i, p]]` is the similarity of tuple `i`'s user to product `p`.
    Scores(Array2<f32>),
    Embeddings {
        users: Array2<f32>,
        products: Array2<f32>,
    },
}

/// The surface the training and evaluation loops drive.
pub trait EmbeddingModel {
    /// Runs one batch. Only `StepMode::Train` mutates parameters, and only
    /// it advances the global step.
    fn step(&mut self, learning_rate: f32, batch: &Batch, mode: StepMode) -> Result<StepOutput>;

    /// Number of gradient updates applied so far, including those made
    /// before the checkpoint this model was restored from.
    fn global_step(&self) -> u64;

    /// Writes a checkpoint named after the global step into `train_dir`.
    fn save(&self, train_dir: &Path) -> Result<PathBuf>;
}

/// Table sizes a parameter set must have to fit a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelShape {
    pub users: usize,
    pub products: usize,
    pub reviews: usize,
    pub vocab: usize,
    pub embed_size: usize,
    pub image_dim: Option<usize>,
    pub user_latent_dim: Option<usize>,
    pub product_latent_dim: Option<usize>,
}

impl ModelShape {
    pub fn new(data_set: &Dataset, review_size: usize, embed_size: usize) -> Self {
        ModelShape {
            users: data_set.user_size(),
            products: data_set.product_size(),
            reviews: review_size,
            vocab: data_set.vocab_size(),
            embed_size,
            image_dim: data_set.image_features.as_ref().map(|m| m.ncols()),
            user_latent_dim: data_set.user_latent_factors.as_ref().map(|m| m.ncols()),
            product_latent_dim: data_set.product_latent_factors.as_ref().map(|m| m.ncols()),
        }
    }
}

/// All trainable parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub user: Array2<f32>,
    pub product: Array2<f32>,
    pub review: Array2<f32>,
    /// Context word vectors, used as input by `NetStruct::Pvc`.
    pub word_in: Array2<f32>,
    /// Output word vectors predicted by every view.
    pub word_out: Array2<f32>,
    pub word_bias: Array1<f32>,
    pub product_bias: Array1<f32>,
    pub image_proj: Option<Array2<f32>>,
    pub user_latent_proj: Option<Array2<f32>>,
    pub product_latent_proj: Option<Array2<f32>>,
}

impl Parameters {
    /// Fresh parameters. Embedding tables are uniform in `(-0.5/d, 0.5/d)`;
    /// output vectors and biases start at zero.
    pub fn new(shape: &ModelShape, rng: &mut StdRng) -> Self {
        let d = shape.embed_size;
        let dist = Uniform::new(-0.5 / d as f32, 0.5 / d as f32);
        let mut table = |rows: usize| Array2::random_using((rows, d), dist, &mut *rng);
        Parameters {
            user: table(shape.users),
            product: table(shape.products),
            review: table(shape.reviews),
            word_in: table(shape.vocab),
            word_out: Array2::zeros((shape.vocab, d)),
            word_bias: Array1::zeros(shape.vocab),
            product_bias: Array1::zeros(shape.products),
            image_proj: shape.image_dim.map(&mut table),
            user_latent_proj: shape.user_latent_dim.map(&mut table),
            product_latent_proj: shape.product_latent_dim.map(&mut table),
        }
    }

    pub fn shape(&self) -> ModelShape {
        ModelShape {
            users: self.user.nrows(),
            products: self.product.nrows(),
            reviews: self.review.nrows(),
            vocab: self.word_out.nrows(),
            embed_size: self.user.ncols(),
            image_dim: self.image_proj.as_ref().map(|m| m.nrows()),
            user_latent_dim: self.user_latent_proj.as_ref().map(|m| m.nrows()),
            product_latent_dim: self.product_latent_proj.as_ref().map(|m| m.nrows()),
        }
    }
}

/// `ln(1 + e^x)` without overflow.
fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Loss and d(loss)/dx for a logit `x` whose label is `positive`.
fn logistic(x: f32, positive: bool) -> (f32, f32) {
    if positive {
        (softplus(-x), sigmoid(x) - 1.0)
    } else {
        (softplus(x), sigmoid(x))
    }
}

/// Gradient rows for one embedding table, keyed by row index.
#[derive(Debug, Default)]
struct SparseGrad {
    rows: HashMap<usize, Array1<f32>>,
}

impl SparseGrad {
    fn add(&mut self, row: usize, g: ArrayView1<'_, f32>, scale: f32) {
        self.rows
            .entry(row)
            .or_insert_with(|| Array1::zeros(g.len()))
            .scaled_add(scale, &g);
    }

    fn sum_sq(&self) -> f32 {
        self.rows.values().map(|g| g.dot(g)).sum()
    }

    fn apply(&self, table: &mut Array2<f32>, factor: f32) {
        for (&row, g) in &self.rows {
            table.row_mut(row).scaled_add(-factor, g);
        }
    }
}

#[derive(Debug, Default)]
struct SparseBias {
    entries: HashMap<usize, f32>,
}

impl SparseBias {
    fn add(&mut self, i: usize, g: f32) {
        *self.entries.entry(i).or_insert(0.0) += g;
    }

    fn sum_sq(&self) -> f32 {
        self.entries.values().map(|g| g * g).sum()
    }

    fn apply(&self, bias: &mut Array1<f32>, factor: f32) {
        for (&i, &g) in &self.entries {
            bias[i] -= factor * g;
        }
    }
}

#[derive(Debug, Default)]
struct Gradients {
    user: SparseGrad,
    product: SparseGrad,
    review: SparseGrad,
    word_in: SparseGrad,
    word_out: SparseGrad,
    word_bias: SparseBias,
    product_bias: SparseBias,
    image_proj: Option<Array2<f32>>,
    user_latent_proj: Option<Array2<f32>>,
    product_latent_proj: Option<Array2<f32>>,
}

fn add_dense(slot: &mut Option<Array2<f32>>, g: ArrayView2<'_, f32>) {
    match slot {
        Some(acc) => *acc += &g,
        None => *slot = Some(g.to_owned()),
    }
}

fn dense_sum_sq(slot: &Option<Array2<f32>>) -> f32 {
    slot.as_ref().map_or(0.0, |g| g.iter().map(|x| x * x).sum())
}

fn apply_dense(param: &mut Option<Array2<f32>>, grad: &Option<Array2<f32>>, factor: f32) {
    if let (Some(p), Some(g)) = (param.as_mut(), grad.as_ref()) {
        p.scaled_add(-factor, g);
    }
}

impl Gradients {
    fn global_norm(&self) -> f32 {
        let sparse = self.user.sum_sq()
            + self.product.sum_sq()
            + self.review.sum_sq()
            + self.word_in.sum_sq()
            + self.word_out.sum_sq()
            + self.word_bias.sum_sq()
            + self.product_bias.sum_sq();
        let dense = dense_sum_sq(&self.image_proj)
            + dense_sum_sq(&self.user_latent_proj)
            + dense_sum_sq(&self.product_latent_proj);
        (sparse + dense).sqrt()
    }

    fn apply(&self, params: &mut Parameters, factor: f32) {
        self.user.apply(&mut params.user, factor);
        self.product.apply(&mut params.product, factor);
        self.review.apply(&mut params.review, factor);
        self.word_in.apply(&mut params.word_in, factor);
        self.word_out.apply(&mut params.word_out, factor);
        self.word_bias.apply(&mut params.word_bias, factor);
        self.product_bias.apply(&mut params.product_bias, factor);
        apply_dense(&mut params.image_proj, &self.image_proj, factor);
        apply_dense(&mut params.user_latent_proj, &self.user_latent_proj, factor);
        apply_dense(&mut params.product_latent_proj, &self.product_latent_proj, factor);
    }
}

/// Which table a view's gradient flows back into.
#[derive(Clone, Copy)]
enum View {
    Review,
    User,
    Product,
}

pub struct MultiViewModel {
    params: Parameters,
    global_step: u64,
    similarity: SimilarityFunc,
    net_struct: NetStruct,
    max_gradient_norm: f32,
    l2_lambda: f32,
    image_weight: f32,
    latent_weight: f32,
    image_features: Option<Array2<f32>>,
    user_latent: Option<Array2<f32>>,
    product_latent: Option<Array2<f32>>,
}

impl MultiViewModel {
    /// A model with freshly initialized parameters. Initialization draws
    /// from its own generator seeded with `config.seed + 1`, separate from
    /// the batch generator's.
    pub fn new(config: &Config, data_set: &Dataset, review_size: usize) -> Self {
        let shape = ModelShape::new(data_set, review_size, config.embed_size);
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        Self::with_parameters(config, data_set, Parameters::new(&shape, &mut rng), 0)
    }

    /// A model resuming from saved parameters.
    pub fn from_checkpoint(
        config: &Config,
        data_set: &Dataset,
        review_size: usize,
        checkpoint: checkpoint::Checkpoint,
    ) -> Result<Self> {
        let expected = ModelShape::new(data_set, review_size, config.embed_size);
        let found = checkpoint.params.shape();
        ensure!(
            found == expected,
            "checkpoint parameters have shape {found:?}, but this dataset needs {expected:?}"
        );
        Ok(Self::with_parameters(
            config,
            data_set,
            checkpoint.params,
            checkpoint.global_step,
        ))
    }

    fn with_parameters(
        config: &Config,
        data_set: &Dataset,
        params: Parameters,
        global_step: u64,
    ) -> Self {
        MultiViewModel {
            params,
            global_step,
            similarity: config.similarity_func,
            net_struct: config.net_struct,
            max_gradient_norm: config.max_gradient_norm,
            l2_lambda: config.l2_lambda,
            image_weight: config.image_weight,
            latent_weight: config.latent_weight,
            image_features: data_set.image_features.clone(),
            user_latent: data_set.user_latent_factors.clone(),
            product_latent: data_set.product_latent_factors.clone(),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Similarity of user `u` to product `p`, with its partial derivatives
    /// with respect to the user vector, the product vector and the product
    /// bias.
    fn similarity(&self, u: usize, p: usize) -> (f32, Array1<f32>, Array1<f32>, f32) {
        let uv = self.params.user.row(u);
        let pv = self.params.product.row(p);
        match self.similarity {
            SimilarityFunc::Product => (uv.dot(&pv), pv.to_owned(), uv.to_owned(), 0.0),
            SimilarityFunc::BiasProduct => (
                uv.dot(&pv) + self.params.product_bias[p],
                pv.to_owned(),
                uv.to_owned(),
                1.0,
            ),
            SimilarityFunc::Cosine => {
                let nu = uv.dot(&uv).sqrt();
                let np = pv.dot(&pv).sqrt();
                if nu == 0.0 || np == 0.0 {
                    let zeros = Array1::zeros(uv.len());
                    return (0.0, zeros.clone(), zeros, 0.0);
                }
                let s = uv.dot(&pv) / (nu * np);
                let du = &pv / (nu * np) - &uv * (s / (nu * nu));
                let dp = &uv / (nu * np) - &pv * (s / (np * np));
                (s, du, dp, 0.0)
            }
        }
    }

    fn score_only(&self, u: usize, p: usize) -> f32 {
        let uv = self.params.user.row(u);
        let pv = self.params.product.row(p);
        match self.similarity {
            SimilarityFunc::Product => uv.dot(&pv),
            SimilarityFunc::BiasProduct => uv.dot(&pv) + self.params.product_bias[p],
            SimilarityFunc::Cosine => {
                let denom = uv.dot(&uv).sqrt() * pv.dot(&pv).sqrt();
                if denom == 0.0 {
                    0.0
                } else {
                    uv.dot(&pv) / denom
                }
            }
        }
    }

    /// Negative-sampling loss for hidden vector `h` predicting `word`.
    /// Adds d(loss)/dh into `dh` and the output-side gradients into `grads`.
    fn word_loss(
        &self,
        h: ArrayView1<'_, f32>,
        word: usize,
        negatives: &[usize],
        scale: f32,
        grads: &mut Gradients,
        dh: &mut Array1<f32>,
    ) -> f32 {
        let mut loss = 0.0;
        let targets = std::iter::once((word, true)).chain(negatives.iter().map(|&n| (n, false)));
        for (w, positive) in targets {
            let o = self.params.word_out.row(w);
            let x = h.dot(&o) + self.params.word_bias[w];
            let (l, dx) = logistic(x, positive);
            loss += l;
            dh.scaled_add(dx * scale, &o);
            grads.word_out.add(w, h, dx * scale);
            grads.word_bias.add(w, dx * scale);
        }
        loss
    }

    /// Squared distance between `v` and `features · proj`, weighted.
    /// Returns the loss, d/dv and d/dproj.
    fn projection_loss(
        v: ArrayView1<'_, f32>,
        features: ArrayView1<'_, f32>,
        proj: &Array2<f32>,
        weight: f32,
    ) -> (f32, Array1<f32>, Array2<f32>) {
        let target = features.dot(proj);
        let diff = &v - &target;
        let loss = 0.5 * weight * diff.dot(&diff);
        let dv = &diff * weight;
        let f = features.insert_axis(Axis(1));
        let dproj = f.dot(&diff.view().insert_axis(Axis(0))) * -weight;
        (loss, dv, dproj)
    }

    fn train_step(&mut self, learning_rate: f32, batch: &Batch) -> Result<StepOutput> {
        ensure!(!batch.is_empty(), "cannot train on an empty batch");
        let n = batch.len();
        let scale = 1.0 / n as f32;
        let d = self.params.user.ncols();
        let mut grads = Gradients::default();
        let mut total_loss = 0.0;

        for i in 0..n {
            let u = batch.user_idxs[i];
            let p = batch.product_idxs[i];
            let r = batch.review_idxs[i];
            let w = batch.word_idxs[i];
            let context = &batch.context_word_idxs[i];
            let negative_words = &batch.negative_word_idxs[i];
            if r >= self.params.review.nrows() {
                bail!(
                    "review index {r} out of range for a model with {} reviews",
                    self.params.review.nrows()
                );
            }

            // Each view predicts the target word.
            for view in [View::Review, View::User, View::Product] {
                let mut dh = Array1::<f32>::zeros(d);
                match view {
                    View::Review if self.net_struct == NetStruct::Pvc && !context.is_empty() => {
                        let k = (context.len() + 1) as f32;
                        let mut h = self.params.review.row(r).to_owned();
                        for &c in context {
                            h += &self.params.word_in.row(c);
                        }
                        h /= k;
                        total_loss += self.word_loss(
                            h.view(),
                            w,
                            negative_words,
                            scale,
                            &mut grads,
                            &mut dh,
                        );
                        grads.review.add(r, dh.view(), 1.0 / k);
                        for &c in context {
                            grads.word_in.add(c, dh.view(), 1.0 / k);
                        }
                    }
                    View::Review => {
                        let h = self.params.review.row(r);
                        total_loss += self.word_loss(
                            h,
                            w,
                            negative_words,
                            scale,
                            &mut grads,
                            &mut dh,
                        );
                        grads.review.add(r, dh.view(), 1.0);
                    }
                    View::User => {
                        let h = self.params.user.row(u);
                        total_loss += self.word_loss(
                            h,
                            w,
                            negative_words,
                            scale,
                            &mut grads,
                            &mut dh,
                        );
                        grads.user.add(u, dh.view(), 1.0);
                    }
                    View::Product => {
                        let h = self.params.product.row(p);
                        total_loss += self.word_loss(
                            h,
                            w,
                            negative_words,
                            scale,
                            &mut grads,
                            &mut dh,
                        );
                        grads.product.add(p, dh.view(), 1.0);
                    }
                }
            }

            // The user prefers the reviewed product over sampled ones.
            let products = std::iter::once((p, true))
                .chain(batch.negative_product_idxs[i].iter().map(|&q| (q, false)));
            for (q, positive) in products {
                let (s, du, dq, db) = self.similarity(u, q);
                let (l, ds) = logistic(s, positive);
                total_loss += l;
                grads.user.add(u, du.view(), ds * scale);
                grads.product.add(q, dq.view(), ds * scale);
                if db != 0.0 {
                    grads.product_bias.add(q, ds * db * scale);
                }
            }

            if let (Some(features), Some(proj)) = (&self.image_features, &self.params.image_proj) {
                let (l, dv, dproj) = Self::projection_loss(
                    self.params.product.row(p),
                    features.row(p),
                    proj,
                    self.image_weight,
                );
                total_loss += l;
                grads.product.add(p, dv.view(), scale);
                add_dense(&mut grads.image_proj, (dproj * scale).view());
            }

            if let (Some(features), Some(proj)) =
                (&self.user_latent, &self.params.user_latent_proj)
            {
                let (l, dv, dproj) = Self::projection_loss(
                    self.params.user.row(u),
                    features.row(u),
                    proj,
                    self.latent_weight,
                );
                total_loss += l;
                grads.user.add(u, dv.view(), scale);
                add_dense(&mut grads.user_latent_proj, (dproj * scale).view());
            }

            if let (Some(features), Some(proj)) =
                (&self.product_latent, &self.params.product_latent_proj)
            {
                let (l, dv, dproj) = Self::projection_loss(
                    self.params.product.row(p),
                    features.row(p),
                    proj,
                    self.latent_weight,
                );
                total_loss += l;
                grads.product.add(p, dv.view(), scale);
                add_dense(&mut grads.product_latent_proj, (dproj * scale).view());
            }

            if self.l2_lambda > 0.0 {
                for (table, grad, row) in [
                    (&self.params.user, &mut grads.user, u),
                    (&self.params.product, &mut grads.product, p),
                    (&self.params.review, &mut grads.review, r),
                ] {
                    let v = table.row(row);
                    total_loss += 0.5 * self.l2_lambda * v.dot(&v);
                    grad.add(row, v, self.l2_lambda * scale);
                }
            }
        }

        let gradient_norm = grads.global_norm();
        let clip = if gradient_norm > self.max_gradient_norm {
            self.max_gradient_norm / gradient_norm
        } else {
            1.0
        };
        grads.apply(&mut self.params, learning_rate * clip);
        self.global_step += 1;

        Ok(StepOutput::Loss {
            loss: total_loss * scale,
            gradient_norm,
        })
    }

    fn scores(&self, batch: &Batch) -> Array2<f32> {
        let num_products = self.params.product.nrows();
        let mut scores = Array2::<f32>::zeros((batch.len(), num_products));
        for (mut row, &u) in scores.rows_mut().into_iter().zip(&batch.user_idxs) {
            for (p, out) in row.iter_mut().enumerate() {
                *out = self.score_only(u, p);
            }
        }
        scores
    }
}

impl EmbeddingModel for MultiViewModel {
    fn step(&mut self, learning_rate: f32, batch: &Batch, mode: StepMode) -> Result<StepOutput> {
        let users = self.params.user.nrows();
        if let Some(&u) = batch.user_idxs.iter().find(|&&u| u >= users) {
            bail!("user index {u} out of range for a model with {users} users");
        }
        match mode {
            StepMode::Train => self.train_step(learning_rate, batch),
            StepMode::Scores => Ok(StepOutput::Scores(self.scores(batch))),
            StepMode::Embeddings => Ok(StepOutput::Embeddings {
                users: self.params.user.clone(),
                products: self.params.product.clone(),
            }),
        }
    }

    fn global_step(&self) -> u64 {
        self.global_step
    }

    fn save(&self, train_dir: &Path) -> Result<PathBuf> {
        checkpoint::save(train_dir, self.global_step, &self.params)
    }
}

/// Restores the latest checkpoint in `config.train_dir` if there is a usable
/// one, otherwise initializes fresh parameters.
pub fn create_model(config: &Config, data_set: &Dataset, review_size: usize) -> MultiViewModel {
    match checkpoint::restore_latest(&config.train_dir) {
        Ok(Some((path, ckpt))) => {
            match MultiViewModel::from_checkpoint(config, data_set, review_size, ckpt) {
                Ok(model) => {
                    info!("Reading model parameters from {}", path.display());
                    return model;
                }
                Err(err) => warn!("Ignoring checkpoint {}: {err:#}", path.display()),
            }
        }
        Ok(None) => {}
        Err(err) => warn!("Could not restore checkpoint: {err:#}"),
    }
    info!("Created model with fresh parameters.");
    MultiViewModel::new(config, data_set, review_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistic_gradients_point_the_right_way() {
        let (loss, d) = logistic(0.0, true);
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(d < 0.0);
        let (_, d) = logistic(0.0, false);
        assert!(d > 0.0);
        assert!(softplus(100.0).is_finite());
        assert!(softplus(-100.0) >= 0.0);
    }

    #[test]
    fn projection_gradient_matches_finite_difference() {
        let v = array![0.3f32, -0.2];
        let f = array![1.0f32, 2.0, -1.0];
        let proj = array![[0.1f32, 0.2], [0.0, -0.1], [0.3, 0.05]];
        let (_, _, dproj) = MultiViewModel::projection_loss(v.view(), f.view(), &proj, 2.0);
        let h = 1e-3;
        for i in 0..3 {
            for j in 0..2 {
                let mut plus = proj.clone();
                plus[[i, j]] += h;
                let mut minus = proj.clone();
                minus[[i, j]] -= h;
                let (lp, _, _) = MultiViewModel::projection_loss(v.view(), f.view(), &plus, 2.0);
                let (lm, _, _) = MultiViewModel::projection_loss(v.view(), f.view(), &minus, 2.0);
                let measured = (lp - lm) / (2.0 * h);
                assert!(
                    (measured - dproj[[i, j]]).abs() < 1e-2,
                    "d/dproj[{i},{j}]: claimed {}, measured {measured}",
                    dproj[[i, j]]
                );
            }
        }
    }
}
