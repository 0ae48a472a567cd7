//! Negative sampling from smoothed frequency distributions.

use rand::Rng;

const MAX_TABLE_SIZE: usize = 10_000_000;

/// Lookup table for drawing ids in proportion to `count^0.75`.
///
/// Each id owns a run of table slots proportional to its smoothed
/// frequency, so a draw is a single uniform index into the table.
#[derive(Clone, Debug)]
pub struct UnigramTable {
    table: Vec<usize>,
}

impl UnigramTable {
    pub fn new(counts: &[u64]) -> Self {
        let power: f64 = 0.75;
        let total_pow = counts.iter().map(|&c| (c as f64).powf(power)).sum::<f64>();
        if counts.is_empty() || total_pow == 0.0 {
            return UnigramTable { table: vec![] };
        }

        let table_size = (counts.len() * 100).clamp(1000, MAX_TABLE_SIZE);
        let mut table = Vec::with_capacity(table_size);
        let mut i = 0;
        let mut d1 = (counts[i] as f64).powf(power) / total_pow;
        let mut last_drawable = 0;
        for a in 0..table_size {
            let x = a as f64 / table_size as f64;
            // Ids with a zero count own no slots.
            while (x >= d1 || counts[i] == 0) && i + 1 < counts.len() {
                i += 1;
                d1 += (counts[i] as f64).powf(power) / total_pow;
            }
            if counts[i] > 0 {
                last_drawable = i;
            }
            table.push(last_drawable);
        }
        UnigramTable { table }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        if self.table.is_empty() {
            None
        } else {
            Some(self.table[rng.gen_range(0..self.table.len())])
        }
    }

    /// Draws up to `n` distinct ids for which `reject` is false.
    ///
    /// Rejection sampling with a budget of `10 * n` draws, so small or
    /// heavily excluded distributions can yield fewer than `n` ids.
    pub fn sample_distinct<R, F>(&self, rng: &mut R, n: usize, reject: F) -> Vec<usize>
    where
        R: Rng + ?Sized,
        F: Fn(usize) -> bool,
    {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n * 10 {
            if out.len() == n {
                break;
            }
            let Some(id) = self.sample(rng) else {
                break;
            };
            if reject(id) || out.contains(&id) {
                continue;
            }
            out.push(id);
        }
        out
    }
}
