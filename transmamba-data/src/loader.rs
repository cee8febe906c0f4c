#[cfg(test)]
#[path = "../tests/unit/loader_test.rs"]
mod loader_test;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use crate::dataset::RandomAccessDataset;
use crate::example::Example;
use crate::shard::{ShardReader, SqliteShardReader};

/// A collated batch; every per-token field is `[batch, seq_len]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub weights: Vec<f32>,
    pub datasets: Vec<String>,
    pub batch_size: usize,
    pub seq_len: usize,
}

/// Shifts examples into next-token `(inputs, targets)` pairs.
pub fn collate(examples: Vec<Example>, pad_id: u32) -> Result<Batch> {
    let seq_len = match examples.first() {
        Some(first) if first.tokens.len() >= 2 => first.tokens.len() - 1,
        Some(first) => anyhow::bail!("Cannot collate examples of {} tokens", first.tokens.len()),
        None => anyhow::bail!("Cannot collate an empty batch"),
    };

    let batch_size = examples.len();
    let mut batch = Batch {
        inputs: Vec::with_capacity(batch_size * seq_len),
        targets: Vec::with_capacity(batch_size * seq_len),
        attention_mask: Vec::with_capacity(batch_size * seq_len),
        weights: Vec::with_capacity(batch_size * seq_len),
        datasets: Vec::with_capacity(batch_size),
        batch_size,
        seq_len,
    };

    for example in examples {
        if example.tokens.len() != seq_len + 1 || example.weights.len() != seq_len {
            anyhow::bail!(
                "Example from '{}' has {} tokens and {} weights, expected {} and {seq_len}",
                example.dataset,
                example.tokens.len(),
                example.weights.len(),
                seq_len + 1
            );
        }

        let inputs = &example.tokens[..seq_len];
        batch.attention_mask.extend(inputs.iter().map(|&id| u8::from(id != pad_id)));
        batch.inputs.extend_from_slice(inputs);
        batch.targets.extend_from_slice(&example.tokens[1..]);
        batch.weights.extend_from_slice(&example.weights);
        batch.datasets.push(example.dataset);
    }

    Ok(batch)
}

/// Iterates over batches of a dataset in a fixed or seeded-shuffled order.
///
/// The rows of a batch are fetched concurrently. With `drop_last` a trailing
/// partial batch is skipped.
pub struct BatchLoader<'a, R: ShardReader> {
    dataset: &'a RandomAccessDataset<R>,
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    cursor: usize,
}

impl<'a, R: ShardReader> BatchLoader<'a, R> {
    pub fn new(
        dataset: &'a RandomAccessDataset<R>,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        drop_last: bool,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }

        let mut order = (0..dataset.len()).collect::<Vec<_>>();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        Ok(Self { dataset, order, batch_size, drop_last, cursor: 0 })
    }

    /// Number of batches a full pass yields.
    pub fn num_batches(&self) -> usize {
        match self.drop_last {
            true => self.order.len() / self.batch_size,
            false => self.order.len().div_ceil(self.batch_size),
        }
    }

    /// Global example indices in iteration order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn load(&self, indices: &[usize]) -> Result<Batch> {
        let examples = indices.par_iter().map(|&idx| self.dataset.get(idx)).collect::<Result<Vec<_>>>()?;
        debug!("Loaded batch of {} examples", examples.len());
        collate(examples, self.dataset.pad_id())
    }
}

impl<R: ShardReader> Iterator for BatchLoader<'_, R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }

        let end = self.cursor + remaining.min(self.batch_size);
        let batch = self.load(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

/// Sorted `*.db` files directly under `dir`.
pub fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read shard directory {}", dir.display()))?;

    let mut shards = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "db") {
            shards.push(path);
        }
    }
    shards.sort();

    if shards.is_empty() {
        anyhow::bail!("No .db shards found in {}", dir.display());
    }
    Ok(shards)
}

/// Train and validation splits found under `<root>/train` and `<root>/val`.
#[derive(Debug)]
pub struct DataModule {
    pub train: RandomAccessDataset,
    pub val: RandomAccessDataset,
    pub batch_size: usize,
}

impl DataModule {
    pub fn setup(root: impl AsRef<Path>, max_seq_len: usize, pad_id: u32, batch_size: usize) -> Result<Self> {
        let root = root.as_ref();
        let train = RandomAccessDataset::open(discover_shards(&root.join("train"))?, max_seq_len, pad_id)?;
        let val = RandomAccessDataset::open(discover_shards(&root.join("val"))?, max_seq_len, pad_id)?;
        info!("Data module at {}: {} train / {} val examples", root.display(), train.len(), val.len());

        Ok(Self { train, val, batch_size })
    }

    /// Shuffled training batches; a trailing partial batch is dropped.
    pub fn train_loader(&self, seed: u64) -> Result<BatchLoader<'_, SqliteShardReader>> {
        BatchLoader::new(&self.train, self.batch_size, Some(seed), true)
    }

    /// Validation batches in index order; a trailing partial batch is dropped.
    pub fn val_loader(&self) -> Result<BatchLoader<'_, SqliteShardReader>> {
        BatchLoader::new(&self.val, self.batch_size, None, true)
    }
}
