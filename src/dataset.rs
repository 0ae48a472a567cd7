//! Interaction records, index spaces and frequency distributions.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use tracing::{debug, info};

use crate::error::DataError;

/// Which review file a dataset was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

impl Mode {
    fn file_name(self) -> &'static str {
        match self {
            Mode::Train => "train.txt",
            Mode::Test => "test.txt",
        }
    }
}

/// One review: who wrote it, about what, and its words as vocabulary indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Review {
    pub user: usize,
    pub product: usize,
    pub words: Vec<usize>,
}

#[derive(Debug)]
pub struct Dataset {
    pub mode: Mode,
    pub vocab: Vec<String>,
    pub user_ids: Vec<String>,
    pub product_ids: Vec<String>,
    pub reviews: Vec<Review>,

    /// Occurrences of each word across `reviews`.
    pub vocab_distribute: Vec<u64>,
    /// Length of each review.
    pub review_distribute: Vec<u64>,
    /// Number of reviews of each product.
    pub product_distribute: Vec<u64>,

    /// Words one epoch is expected to train on. After `sub_sampling` this is
    /// the expected number of kept words, so it need not be an integer.
    pub word_count: f64,

    /// Probability of keeping each word, once `sub_sampling` has run.
    keep_probability: Option<Vec<f64>>,

    /// `image_features[p]` is the feature row for product `p`.
    pub image_features: Option<Array2<f32>>,
    pub user_latent_factors: Option<Array2<f32>>,
    pub product_latent_factors: Option<Array2<f32>>,

    /// For test datasets: the products each user reviewed in training.
    pub user_train_products: Option<Vec<HashSet<usize>>>,
    /// Number of training reviews; sizes the model's review table.
    pub train_review_size: usize,
}

fn open_lines(path: &Path) -> Result<impl Iterator<Item = std::io::Result<String>>> {
    if !path.exists() {
        return Err(DataError::MissingFile(path.to_path_buf()).into());
    }
    let f = File::open(path).with_context(|| format!("error opening {}", path.display()))?;
    Ok(BufReader::new(f).lines())
}

/// Reads a one-entry-per-line id file, skipping nothing: the line number is the index.
fn read_id_file(path: &Path) -> Result<Vec<String>> {
    let mut ids = vec![];
    for line in open_lines(path)? {
        let line = line.with_context(|| format!("error reading {}", path.display()))?;
        ids.push(line.trim_end_matches('\r').trim().to_string());
    }
    Ok(ids)
}

fn parse_index(
    path: &Path,
    line_num: usize,
    field: &str,
    kind: &'static str,
    size: usize,
) -> Result<usize> {
    let index: usize = field.parse().map_err(|_| DataError::Malformed {
        path: path.to_path_buf(),
        line: line_num + 1,
        reason: format!("invalid {kind} index {field:?}"),
    })?;
    if index >= size {
        return Err(DataError::IndexOutOfRange { kind, index, size }.into());
    }
    Ok(index)
}

/// Reads `user_idx<TAB>product_idx<TAB>w1 w2 ...` lines.
fn read_reviews(
    path: &Path,
    num_users: usize,
    num_products: usize,
    vocab_size: usize,
    limit: usize,
) -> Result<Vec<Review>> {
    let mut reviews = vec![];
    for (line_num, line) in open_lines(path)?.enumerate() {
        let line = line.with_context(|| format!("error reading {}", path.display()))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let (Some(user), Some(product)) = (fields.next(), fields.next()) else {
            return Err(DataError::Malformed {
                path: path.to_path_buf(),
                line: line_num + 1,
                reason: "expected user and product indices separated by a tab".to_string(),
            }
            .into());
        };
        let user = parse_index(path, line_num, user.trim(), "user", num_users)?;
        let product = parse_index(path, line_num, product.trim(), "product", num_products)?;
        let words = fields
            .next()
            .unwrap_or("")
            .split_whitespace()
            .map(|w| parse_index(path, line_num, w, "word", vocab_size))
            .collect::<Result<Vec<usize>>>()?;
        reviews.push(Review {
            user,
            product,
            words,
        });
        if limit > 0 && reviews.len() >= limit {
            break;
        }
    }
    Ok(reviews)
}

/// Reads `id v1 v2 ...` rows and lays them out in the order of `ids`.
fn read_feature_rows(path: &Path, ids: &[String], kind: &'static str) -> Result<Array2<f32>> {
    let mut rows: HashMap<String, Vec<f32>> = HashMap::new();
    let mut width = None;
    for (line_num, line) in open_lines(path)?.enumerate() {
        let line = line.with_context(|| format!("error reading {}", path.display()))?;
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next() else {
            continue;
        };
        let values = fields
            .map(|v| {
                v.parse::<f32>().map_err(|_| DataError::Malformed {
                    path: path.to_path_buf(),
                    line: line_num + 1,
                    reason: format!("invalid feature value {v:?}"),
                })
            })
            .collect::<Result<Vec<f32>, DataError>>()?;
        let expected = *width.get_or_insert(values.len());
        if values.len() != expected {
            return Err(DataError::DimensionMismatch {
                path: path.to_path_buf(),
                expected,
                found: values.len(),
            }
            .into());
        }
        rows.insert(id.to_string(), values);
    }

    let width = width.unwrap_or(0);
    let mut m = Array2::<f32>::zeros((ids.len(), width));
    for (i, id) in ids.iter().enumerate() {
        let row = rows.get(id).ok_or_else(|| DataError::MissingKey {
            kind,
            key: id.clone(),
        })?;
        for (out, &v) in m.row_mut(i).iter_mut().zip(row) {
            *out = v;
        }
    }
    Ok(m)
}

impl Dataset {
    /// Loads the index spaces from `data_dir` and the reviews for `mode`
    /// from `input_train_dir`.
    ///
    /// `max_reviews` limits how many reviews are read; 0 means no limit.
    pub fn load(
        data_dir: &Path,
        input_train_dir: &Path,
        mode: Mode,
        max_reviews: usize,
    ) -> Result<Self> {
        let vocab = read_id_file(&data_dir.join("vocab.txt"))?;
        let user_ids = read_id_file(&data_dir.join("users.txt"))?;
        let product_ids = read_id_file(&data_dir.join("product.txt"))?;
        let reviews = read_reviews(
            &input_train_dir.join(mode.file_name()),
            user_ids.len(),
            product_ids.len(),
            vocab.len(),
            max_reviews,
        )?;
        let dataset = Self::from_parts(mode, vocab, user_ids, product_ids, reviews)?;
        info!(
            "Loaded {} reviews ({} words) over {} users, {} products, {} vocabulary words",
            dataset.review_size(),
            dataset.word_count,
            dataset.user_size(),
            dataset.product_size(),
            dataset.vocab_size(),
        );
        Ok(dataset)
    }

    /// Builds a dataset from records already in memory, computing the
    /// frequency distributions.
    pub fn from_parts(
        mode: Mode,
        vocab: Vec<String>,
        user_ids: Vec<String>,
        product_ids: Vec<String>,
        reviews: Vec<Review>,
    ) -> Result<Self> {
        if vocab.is_empty() {
            return Err(DataError::EmptyDataset("vocabulary").into());
        }
        if user_ids.is_empty() {
            return Err(DataError::EmptyDataset("users").into());
        }
        if product_ids.is_empty() {
            return Err(DataError::EmptyDataset("products").into());
        }
        if reviews.is_empty() {
            return Err(DataError::EmptyDataset("reviews").into());
        }

        let mut vocab_distribute = vec![0u64; vocab.len()];
        let mut product_distribute = vec![0u64; product_ids.len()];
        let mut review_distribute = Vec::with_capacity(reviews.len());
        for review in &reviews {
            for (kind, index, size) in [
                ("user", review.user, user_ids.len()),
                ("product", review.product, product_ids.len()),
            ] {
                if index >= size {
                    return Err(DataError::IndexOutOfRange { kind, index, size }.into());
                }
            }
            for &w in &review.words {
                if w >= vocab.len() {
                    return Err(DataError::IndexOutOfRange {
                        kind: "word",
                        index: w,
                        size: vocab.len(),
                    }
                    .into());
                }
                vocab_distribute[w] += 1;
            }
            product_distribute[review.product] += 1;
            review_distribute.push(review.words.len() as u64);
        }

        let word_count = review_distribute.iter().sum::<u64>();
        if mode == Mode::Train && word_count == 0 {
            return Err(DataError::EmptyDataset("words in any review").into());
        }

        let train_review_size = match mode {
            Mode::Train => reviews.len(),
            Mode::Test => 0,
        };
        Ok(Dataset {
            mode,
            vocab,
            user_ids,
            product_ids,
            reviews,
            vocab_distribute,
            review_distribute,
            product_distribute,
            word_count: word_count as f64,
            keep_probability: None,
            image_features: None,
            user_latent_factors: None,
            product_latent_factors: None,
            user_train_products: None,
            train_review_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn user_size(&self) -> usize {
        self.user_ids.len()
    }

    pub fn product_size(&self) -> usize {
        self.product_ids.len()
    }

    pub fn review_size(&self) -> usize {
        self.reviews.len()
    }

    /// Sets up subsampling of frequent words.
    ///
    /// A word with empirical frequency `f` is kept with probability
    /// `min(1, sqrt(rate / f))`, so words with `f <= rate` are always kept.
    /// `word_count` becomes the expected number of kept words per epoch.
    pub fn sub_sampling(&mut self, rate: f64) {
        let total = self.vocab_distribute.iter().sum::<u64>() as f64;
        let keep: Vec<f64> = self
            .vocab_distribute
            .iter()
            .map(|&count| {
                if rate <= 0.0 || count == 0 {
                    return 1.0;
                }
                let f = count as f64 / total;
                (rate / f).sqrt().min(1.0)
            })
            .collect();
        self.word_count = self
            .vocab_distribute
            .iter()
            .zip(&keep)
            .map(|(&count, &p)| count as f64 * p)
            .sum();
        debug!("Subsampling at rate {rate}: {} expected words per epoch", self.word_count);
        self.keep_probability = Some(keep);
    }

    /// Probability that an occurrence of `word` survives subsampling.
    pub fn keep_probability(&self, word: usize) -> f64 {
        match &self.keep_probability {
            Some(keep) => keep[word],
            None => 1.0,
        }
    }

    /// Merges the product image features from `data_dir`.
    pub fn read_image_features(&mut self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join("product_image_feature.txt");
        let features = read_feature_rows(&path, &self.product_ids, "product image")?;
        info!("Read {}-dimensional image features", features.ncols());
        self.image_features = Some(features);
        Ok(())
    }

    /// Merges the user and product latent rating factors from `data_dir`.
    pub fn read_latent_factor(&mut self, data_dir: &Path) -> Result<()> {
        let users = read_feature_rows(
            &data_dir.join("user_latent_factors.txt"),
            &self.user_ids,
            "user latent factor",
        )?;
        let products = read_feature_rows(
            &data_dir.join("product_latent_factors.txt"),
            &self.product_ids,
            "product latent factor",
        )?;
        info!(
            "Read latent factors: {} dimensions for users, {} for products",
            users.ncols(),
            products.ncols()
        );
        self.user_latent_factors = Some(users);
        self.product_latent_factors = Some(products);
        Ok(())
    }

    /// Reads `train.txt` from `input_train_dir` to learn which products each
    /// user has already reviewed, and how many training reviews there were.
    ///
    /// `max_reviews` must be the limit training ran with, so the review count
    /// matches the trained model's review table; 0 means no limit.
    pub fn read_train_product_ids(
        &mut self,
        input_train_dir: &Path,
        max_reviews: usize,
    ) -> Result<()> {
        let train = read_reviews(
            &input_train_dir.join(Mode::Train.file_name()),
            self.user_size(),
            self.product_size(),
            self.vocab_size(),
            max_reviews,
        )?;
        let mut seen = vec![HashSet::new(); self.user_size()];
        for review in &train {
            seen[review.user].insert(review.product);
        }
        self.train_review_size = train.len();
        self.user_train_products = Some(seen);
        Ok(())
    }
}
