#[cfg(test)]
#[path = "../tests/unit/index_test.rs"]
mod index_test;

use std::path::{Path, PathBuf};

use anyhow::Result;

/// Maps a flat example index onto `(shard, local row)` pairs.
///
/// `cumulative[i]` is the number of rows in shards `0..=i`, so the array is
/// non-decreasing and its last entry is the dataset length.
#[derive(Debug, Clone, Default)]
pub struct ShardIndex {
    paths: Vec<PathBuf>,
    cumulative: Vec<usize>,
}

/// Location of one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub shard: usize,
    pub row: usize,
}

impl ShardIndex {
    pub fn new(shards: impl IntoIterator<Item = (PathBuf, usize)>) -> Self {
        let mut total = 0;
        let (paths, cumulative) = shards
            .into_iter()
            .map(|(path, rows)| {
                total += rows;
                (path, total)
            })
            .unzip();

        Self { paths, cumulative }
    }

    pub fn len(&self) -> usize {
        self.cumulative.last().copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.paths.len()
    }

    pub fn shard_path(&self, shard: usize) -> Option<&Path> {
        self.paths.get(shard).map(PathBuf::as_path)
    }

    /// Rows held by `shard`.
    pub fn shard_rows(&self, shard: usize) -> usize {
        match shard {
            0 => self.cumulative.first().copied().unwrap_or_default(),
            s => self.cumulative.get(s).map_or(0, |&c| c - self.cumulative[s - 1]),
        }
    }

    /// Finds the first shard whose cumulative count exceeds `index`.
    pub fn resolve(&self, index: usize) -> Result<RowLocation> {
        if index >= self.len() {
            anyhow::bail!("Example index {index} is out of range for a dataset of {} rows", self.len());
        }

        let shard = self.cumulative.partition_point(|&count| count <= index);
        let offset = if shard == 0 { 0 } else { self.cumulative[shard - 1] };

        Ok(RowLocation { shard, row: index - offset })
    }
}
