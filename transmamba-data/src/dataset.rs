#[cfg(test)]
#[path = "../tests/unit/dataset_test.rs"]
mod dataset_test;

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{error, info};

use crate::example::{Example, build_example, decode_tokens};
use crate::index::ShardIndex;
use crate::shard::{ShardReader, SqliteShardReader};

/// Flat, random-access view over a list of read-only shards.
pub struct RandomAccessDataset<R = SqliteShardReader> {
    index: ShardIndex,
    reader: R,
    max_seq_len: usize,
    pad_id: u32,
}

impl RandomAccessDataset {
    /// Indexes SQLite shards in the given order.
    pub fn open(paths: Vec<PathBuf>, max_seq_len: usize, pad_id: u32) -> Result<Self> {
        Self::with_reader(paths, SqliteShardReader, max_seq_len, pad_id)
    }
}

impl<R: ShardReader> RandomAccessDataset<R> {
    pub fn with_reader(paths: Vec<PathBuf>, reader: R, max_seq_len: usize, pad_id: u32) -> Result<Self> {
        let mut shards = Vec::with_capacity(paths.len());
        let mut total = 0;
        for path in paths {
            let rows = reader.count_rows(&path)?;
            total += rows;
            info!("DB {} has {rows} rows. Total rows {total}", path.display());
            shards.push((path, rows));
        }

        Ok(Self { index: ShardIndex::new(shards), reader, max_seq_len, pad_id })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Reads, decodes and pads the example at global position `idx`.
    ///
    /// Failures are logged with the index and shard and returned; rows are never skipped.
    pub fn get(&self, idx: usize) -> Result<Example> {
        let location = self.index.resolve(idx)?;
        let path = self
            .index
            .shard_path(location.shard)
            .with_context(|| format!("Shard {} is not indexed", location.shard))?;

        let fetch = || -> Result<Example> {
            let row = self.reader.read_row(path, location.row)?;
            let tokens = decode_tokens(&row.seq)?;
            build_example(tokens, row.pred_start, row.dataset, self.max_seq_len, self.pad_id)
        };

        fetch().map_err(|err| {
            error!("Failed to load example idx={idx} from {} row {}: {err:#}", path.display(), location.row);
            err.context(format!("Failed to load example {idx}"))
        })
    }
}

impl<R> std::fmt::Debug for RandomAccessDataset<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomAccessDataset")
            .field("shards", &self.index.shard_count())
            .field("rows", &self.index.len())
            .field("max_seq_len", &self.max_seq_len)
            .field("pad_id", &self.pad_id)
            .finish()
    }
}
