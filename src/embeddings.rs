//! Exported embedding files: writing them from the model's tables and
//! reading them back.
//!
//! The format is a header line `{rows} {dim}` followed by one line per
//! entity: its id, then `dim` space-separated numbers.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Index;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use ndarray::ArrayView2;
use ordered_float::OrderedFloat;

use crate::dataset::Dataset;

impl Dataset {
    /// Writes row `i` of `matrix` under `ids[i]`.
    pub fn output_embedding(
        matrix: ArrayView2<'_, f32>,
        ids: &[String],
        path: &Path,
    ) -> Result<()> {
        ensure!(
            matrix.nrows() == ids.len(),
            "{} embedding rows for {} ids",
            matrix.nrows(),
            ids.len()
        );
        let mut fo = BufWriter::new(
            File::create(path).with_context(|| format!("error creating {}", path.display()))?,
        );
        writeln!(fo, "{} {}", matrix.nrows(), matrix.ncols()).context("error writing embeddings")?;
        for (id, row) in ids.iter().zip(matrix.rows()) {
            write!(fo, "{id}").context("error writing embeddings")?;
            for v in row {
                write!(fo, " {v}").context("error writing embeddings")?;
            }
            writeln!(fo).context("error writing embeddings")?;
        }
        fo.flush().context("error writing embeddings")?;
        Ok(())
    }
}

pub struct EmbeddingTable {
    /// Embedding vector length (number of dimensions).
    size: usize,

    ids: Vec<String>,

    /// `embeddings[k * size..(k+1) * size]` is the vector for entity `k`.
    embeddings: Vec<f32>,
}

impl Index<usize> for EmbeddingTable {
    type Output = [f32];

    fn index(&self, i: usize) -> &[f32] {
        &self.embeddings[i * self.size..][..self.size]
    }
}

impl EmbeddingTable {
    pub fn load(file_name: &Path) -> Result<Self> {
        let f = BufReader::new(
            File::open(file_name)
                .with_context(|| format!("error opening {}", file_name.display()))?,
        );
        let mut lines = f.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("empty embedding file"))?
            .context("error reading embedding file")?;
        let mut fields = header.split_whitespace();
        let rows: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid embedding file header"))?
            .parse()
            .context("invalid embedding file header")?;
        let size: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid embedding file header"))?
            .parse()
            .context("invalid embedding file header")?;

        let mut ids = Vec::with_capacity(rows);
        let mut embeddings = Vec::with_capacity(rows * size);
        for (lineno, line) in lines.enumerate() {
            let line = line.context("error reading embedding file")?;
            let mut fields = line.split_whitespace();
            let Some(id) = fields.next() else {
                continue;
            };
            let before = embeddings.len();
            for v in fields {
                embeddings.push(
                    v.parse::<f32>()
                        .with_context(|| format!("bad number on line {}", lineno + 2))?,
                );
            }
            if embeddings.len() - before != size {
                bail!(
                    "line {} has {} values, expected {size}",
                    lineno + 2,
                    embeddings.len() - before
                );
            }
            ids.push(id.to_string());
        }
        ensure!(
            ids.len() == rows,
            "header promises {rows} rows, found {}",
            ids.len()
        );

        Ok(EmbeddingTable {
            size,
            ids,
            embeddings,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.ids.len()
    }

    /// Returns the vector size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Index of an entity id. Exact match only.
    pub fn lookup(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|v| v == id)
    }

    /// Panics if `i` is out of range.
    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    /// The `n` rows with the largest dot product with `query`, best first.
    /// With `cosine`, rows and query are compared by direction only.
    pub fn nearest(&self, query: &[f32], n: usize, cosine: bool) -> Vec<(usize, f32)> {
        let q_len = if cosine { length(query) } else { 1.0 };
        let mut best: Vec<(usize, f32)> = (0..self.num_rows())
            .map(|i| {
                let row = &self[i];
                let mut score = dot(query, row);
                if cosine {
                    let scale = q_len * length(row);
                    score = if scale == 0.0 { 0.0 } else { score / scale };
                }
                (i, score)
            })
            .collect();
        best.sort_by_key(|&(_, score)| Reverse(OrderedFloat(score)));
        best.truncate(n);
        best
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn length(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}
