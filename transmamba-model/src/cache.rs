#[cfg(test)]
#[path = "../tests/unit/cache_test.rs"]
mod cache_test;

use std::ops::Range;

use anyhow::Result;
use log::debug;
use rayon::prelude::*;

use crate::configuration::ModelConfig;
use crate::mesh::{ExecutionContext, MeshExecution};

/// Slice of the cache owned by one sequence-parallel unit.
struct CacheShard {
    range: Range<usize>,
    /// [batch, shard_len, heads, head_dim]
    keys: Vec<f32>,
    /// [batch, shard_len, heads, head_dim]
    values: Vec<f32>,
    /// [batch, shard_len]
    key_mask: Vec<u8>,
}

impl CacheShard {
    fn len(&self) -> usize {
        self.range.len()
    }
}

/// Key/value cache of one attention layer.
///
/// Buffers are zero-filled `[batch, max_length, heads, head_dim]`, split along
/// the sequence axis into one shard per sequence-parallel unit. `index` is the
/// number of positions written so far.
pub struct LayerCache {
    batch: usize,
    max_length: usize,
    heads: usize,
    head_dim: usize,
    index: usize,
    shards: Vec<CacheShard>,
}

impl LayerCache {
    pub fn new(batch: usize, max_length: usize, heads: usize, head_dim: usize, mesh: &dyn MeshExecution) -> Result<Self> {
        let sp = mesh.sequence_parallel_size();
        if max_length == 0 || max_length % sp != 0 {
            anyhow::bail!("Cache length {max_length} must be a positive multiple of the sequence-parallel size {sp}");
        }

        let row = heads * head_dim;
        let shards = mesh
            .partition(max_length)
            .into_iter()
            .map(|range| CacheShard {
                keys: vec![0.0; batch * range.len() * row],
                values: vec![0.0; batch * range.len() * row],
                key_mask: vec![0; batch * range.len()],
                range,
            })
            .collect();

        Ok(Self { batch, max_length, heads, head_dim, index: 0, shards })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn shard_ranges(&self) -> Vec<Range<usize>> {
        self.shards.iter().map(|shard| shard.range.clone()).collect()
    }

    /// Writes `len` new positions at the cursor and advances it.
    ///
    /// `keys`/`values` are `[batch, len, heads, head_dim]`, `key_mask` is
    /// `[batch, len]`. Each position is routed to the single shard whose range
    /// contains it; the other shards pass through. Returns the cursor before the write.
    pub fn write(&mut self, keys: &[f32], values: &[f32], key_mask: &[u8], len: usize) -> Result<usize> {
        let row = self.heads * self.head_dim;
        if keys.len() != self.batch * len * row || values.len() != keys.len() || key_mask.len() != self.batch * len {
            anyhow::bail!(
                "Cache expects batch {} x {len} positions x {row} features, got {} keys, {} values, {} mask entries",
                self.batch,
                keys.len(),
                values.len(),
                key_mask.len()
            );
        }

        let start = self.index;
        if start + len > self.max_length {
            anyhow::bail!("KV cache overflow: writing {len} positions at index {start} exceeds max length {}", self.max_length);
        }

        let batch = self.batch;
        self.shards.par_iter_mut().for_each(|shard| {
            let (range, shard_len) = (shard.range.clone(), shard.len());
            for pos in (start..start + len).filter(|pos| range.contains(pos)) {
                let local = pos - range.start;
                let step = pos - start;
                for b in 0..batch {
                    let dst = (b * shard_len + local) * row;
                    let src = (b * len + step) * row;
                    shard.keys[dst..dst + row].copy_from_slice(&keys[src..src + row]);
                    shard.values[dst..dst + row].copy_from_slice(&values[src..src + row]);
                    shard.key_mask[b * shard_len + local] = key_mask[b * len + step];
                }
            }
        });

        self.index += len;
        debug!("Cache advanced {start} -> {}", self.index);
        Ok(start)
    }

    /// Gathers all shards into `[batch, max_length, heads, head_dim]` keys.
    pub fn keys(&self) -> Vec<f32> {
        self.gather(|shard| &shard.keys, self.heads * self.head_dim)
    }

    /// Gathers all shards into `[batch, max_length, heads, head_dim]` values.
    pub fn values(&self) -> Vec<f32> {
        self.gather(|shard| &shard.values, self.heads * self.head_dim)
    }

    /// Gathers the per-position key mask, `[batch, max_length]`; unwritten positions are 0.
    pub fn key_mask(&self) -> Vec<u8> {
        self.gather(|shard| &shard.key_mask, 1)
    }

    fn gather<T: Copy + Default>(&self, field: impl Fn(&CacheShard) -> &Vec<T>, row: usize) -> Vec<T> {
        let mut out = vec![T::default(); self.batch * self.max_length * row];
        for shard in &self.shards {
            let data = field(shard);
            let shard_len = shard.len();
            for b in 0..self.batch {
                let dst = (b * self.max_length + shard.range.start) * row;
                let src = b * shard_len * row;
                out[dst..dst + shard_len * row].copy_from_slice(&data[src..src + shard_len * row]);
            }
        }
        out
    }
}

impl std::fmt::Debug for LayerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCache")
            .field("batch", &self.batch)
            .field("max_length", &self.max_length)
            .field("index", &self.index)
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Decoding-session state: one [`LayerCache`] per attention layer.
#[derive(Debug)]
pub struct ModelCache {
    pub layers: Vec<LayerCache>,
}

impl ModelCache {
    pub fn new(config: &ModelConfig, batch: usize, max_length: usize, context: &ExecutionContext) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|_| {
                LayerCache::new(batch, max_length, config.num_attention_heads, config.head_dim(), context.mesh.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Cursor shared by all layers.
    pub fn index(&self) -> usize {
        self.layers.first().map(LayerCache::index).unwrap_or_default()
    }

    pub fn batch(&self) -> usize {
        self.layers.first().map(LayerCache::batch).unwrap_or_default()
    }

    pub fn max_length(&self) -> usize {
        self.layers.first().map(LayerCache::max_length).unwrap_or_default()
    }
}
