#[cfg(test)]
#[path = "../tests/unit/attention_test.rs"]
mod attention_test;

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use rayon::prelude::*;

use crate::cache::LayerCache;
use crate::dropout::{DropoutStream, apply_dropout};
use crate::layers::Linear;
use crate::mesh::{KvBlock, MeshExecution};
use crate::rotary::RotaryTable;
use crate::tensor::softmax;

/// Additive bias for a disallowed query/key pair.
const MASKED_BIAS: f32 = f32::MIN;

const ATTENTION_WEIGHTS_SITE: u64 = 1;
const ATTENTION_OUTPUT_SITE: u64 = 2;

/// Shapes of one attention call. Tensors are laid out `[batch, len, heads, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub batch: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub heads: usize,
    pub head_dim: usize,
}

impl AttentionDims {
    fn scale(&self) -> f32 {
        (self.head_dim as f32).sqrt().recip()
    }
}

/// Which query/key pairs may attend to each other.
///
/// A pair `(q, k)` is visible when the key is not padding, `k <= query_offset + q`
/// (causality, shifted by the cache cursor during decoding), both lie in the
/// same segment, and the forgetful mask keeps the pair.
#[derive(Debug, Clone, Copy)]
pub struct AttentionMask<'a> {
    pub query_offset: usize,
    /// [batch, kv_len]
    pub key_mask: &'a [u8],
    /// `([batch, q_len], [batch, kv_len])`
    pub segments: Option<(&'a [i64], &'a [i64])>,
    /// [batch, q_len, kv_len], `true` keeps the pair
    pub forget_mask: Option<&'a [bool]>,
}

/// Query and key chunk lengths of the blockwise path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub query: usize,
    pub key: usize,
}

/// Dropout on attention probabilities.
#[derive(Debug, Clone, Copy)]
pub struct AttentionDropout {
    pub rate: f32,
    pub stream: DropoutStream,
}

impl AttentionDropout {
    /// Multiplier for the probability of `(b, h, q, k)`: 0 or `1 / (1 - rate)`.
    #[inline]
    fn factor(&self, b: usize, h: usize, q: usize, k: usize) -> f32 {
        match self.stream.keep([b as u64, h as u64, q as u64, k as u64], self.rate) {
            true => (1.0 - self.rate).recip(),
            false => 0.0,
        }
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

#[inline]
fn bias(visible: bool) -> f32 {
    if visible { 0.0 } else { MASKED_BIAS }
}

/// Full-materialization attention: one score row per (query, head), additive mask bias, softmax.
pub fn standard_attention(
    query: &[f32],
    key: &[f32],
    value: &[f32],
    dims: AttentionDims,
    mask: &AttentionMask,
    dropout: Option<AttentionDropout>,
) -> Vec<f32> {
    let AttentionDims { q_len, kv_len, heads, head_dim, .. } = dims;
    let row = heads * head_dim;
    let scale = dims.scale();
    let mut output = vec![0.0; dims.batch * q_len * row];

    output.par_chunks_mut(row).enumerate().for_each(|(idx, out_row)| {
        let (b, qi) = (idx / q_len, idx % q_len);
        let query_pos = mask.query_offset + qi;
        let mut scores = vec![0.0f32; kv_len];

        for h in 0..heads {
            let q = &query[idx * row + h * head_dim..][..head_dim];
            let mut any_visible = false;

            scores.iter_mut().enumerate().for_each(|(kj, score)| {
                let k = &key[(b * kv_len + kj) * row + h * head_dim..][..head_dim];
                let visible = is_visible(mask, b, q_len, kv_len, qi, query_pos, kj);
                any_visible |= visible;
                *score = dot(q, k) * scale + bias(visible);
            });

            let out = &mut out_row[h * head_dim..(h + 1) * head_dim];
            out.fill(0.0);
            // nothing to attend to: the row stays zero
            if !any_visible {
                continue;
            }

            softmax(&mut scores);

            for (kj, &p) in scores.iter().enumerate() {
                let p = match dropout {
                    Some(dropout) => p * dropout.factor(b, h, query_pos, kj),
                    None => p,
                };
                let v = &value[(b * kv_len + kj) * row + h * head_dim..][..head_dim];
                out.iter_mut().zip(v).for_each(|(o, &v)| *o += p * v);
            }
        }
    });

    output
}

#[inline]
fn is_visible(mask: &AttentionMask, b: usize, q_len: usize, kv_len: usize, qi: usize, query_pos: usize, kj: usize) -> bool {
    let segment_ok = mask.segments.is_none_or(|(qs, ks)| qs[b * q_len + qi] == ks[b * kv_len + kj]);
    let forget_ok = mask.forget_mask.is_none_or(|keep| keep[(b * q_len + qi) * kv_len + kj]);
    mask.key_mask[b * kv_len + kj] != 0 && kj <= query_pos && segment_ok && forget_ok
}

/// Running softmax statistics of the queries owned by one ring unit.
struct UnitAccumulator {
    range: std::ops::Range<usize>,
    /// [batch, n, heads]
    max: Vec<f32>,
    /// [batch, n, heads]
    sum: Vec<f32>,
    /// [batch, n, heads, head_dim]
    acc: Vec<f32>,
}

/// Blockwise ring attention.
///
/// Queries and keys are partitioned across the mesh's sequence-parallel units.
/// Each unit keeps its query block and running `(max, sum, acc)` statistics;
/// key/value blocks travel around the ring, and every unit folds each visiting
/// block in `chunks.query x chunks.key` tiles using an online softmax. Tiles
/// entirely in the causal future are skipped. After a full rotation the
/// result equals [`standard_attention`] up to rounding; queries without any
/// visible key produce zeros on both paths.
///
/// The forgetful mask is not applied on this path.
#[allow(clippy::too_many_arguments)]
pub fn ring_attention(
    query: &[f32],
    key: &[f32],
    value: &[f32],
    dims: AttentionDims,
    mask: &AttentionMask,
    chunks: ChunkSizes,
    mesh: &dyn MeshExecution,
    dropout: Option<AttentionDropout>,
) -> Result<Vec<f32>> {
    if chunks.query == 0 || chunks.key == 0 {
        anyhow::bail!("Attention chunk sizes must be positive, got {chunks:?}");
    }

    let AttentionDims { batch, q_len, kv_len, heads, head_dim } = dims;
    let row = heads * head_dim;

    let mut blocks = mesh
        .partition(kv_len)
        .into_iter()
        .map(|range| {
            let n = range.len();
            let mut block = KvBlock {
                start: range.start,
                len: n,
                keys: Vec::with_capacity(batch * n * row),
                values: Vec::with_capacity(batch * n * row),
                key_mask: Vec::with_capacity(batch * n),
                segment_ids: mask.segments.map(|_| Vec::with_capacity(batch * n)),
            };
            for b in 0..batch {
                let (lo, hi) = (b * kv_len + range.start, b * kv_len + range.end);
                block.keys.extend_from_slice(&key[lo * row..hi * row]);
                block.values.extend_from_slice(&value[lo * row..hi * row]);
                block.key_mask.extend_from_slice(&mask.key_mask[lo..hi]);
                if let (Some(ids), Some((_, key_segments))) = (block.segment_ids.as_mut(), mask.segments) {
                    ids.extend_from_slice(&key_segments[lo..hi]);
                }
            }
            block
        })
        .collect::<Vec<_>>();

    let mut units = mesh
        .partition(q_len)
        .into_iter()
        .map(|range| {
            let n = range.len();
            UnitAccumulator {
                range,
                max: vec![f32::NEG_INFINITY; batch * n * heads],
                sum: vec![0.0; batch * n * heads],
                acc: vec![0.0; batch * n * row],
            }
        })
        .collect::<Vec<_>>();

    if units.len() != blocks.len() {
        anyhow::bail!("Mesh produced {} query blocks but {} key blocks", units.len(), blocks.len());
    }

    debug!("Ring attention over {} units, chunks {chunks:?}", units.len());

    for _ in 0..units.len() {
        units.par_iter_mut().zip(blocks.par_iter()).for_each(|(unit, block)| {
            absorb_block(unit, block, query, dims, mask, chunks, dropout);
        });
        mesh.ring_exchange(&mut blocks);
    }

    let mut output = vec![0.0; batch * q_len * row];
    for unit in &units {
        let n = unit.range.len();
        for b in 0..batch {
            for (local, qi) in unit.range.clone().enumerate() {
                for h in 0..heads {
                    let stat = (b * n + local) * heads + h;
                    let sum = unit.sum[stat];
                    let src = &unit.acc[stat * head_dim..(stat + 1) * head_dim];
                    let dst = &mut output[(b * q_len + qi) * row + h * head_dim..][..head_dim];
                    if sum > 0.0 {
                        dst.iter_mut().zip(src).for_each(|(o, &a)| *o = a / sum);
                    }
                }
            }
        }
    }

    Ok(output)
}

/// Folds one visiting key/value block into a unit's running statistics.
fn absorb_block(
    unit: &mut UnitAccumulator,
    block: &KvBlock,
    query: &[f32],
    dims: AttentionDims,
    mask: &AttentionMask,
    chunks: ChunkSizes,
    dropout: Option<AttentionDropout>,
) {
    let AttentionDims { q_len, heads, head_dim, .. } = dims;
    let row = heads * head_dim;
    let scale = dims.scale();
    let n = unit.range.len();
    let range = unit.range.clone();

    if n == 0 || block.len == 0 {
        return;
    }

    unit.max
        .par_chunks_mut(n * heads)
        .zip(unit.sum.par_chunks_mut(n * heads))
        .zip(unit.acc.par_chunks_mut(n * row))
        .enumerate()
        .for_each(|(b, ((max, sum), acc))| {
            let mut scores = vec![0.0f32; chunks.key];

            for q_start in range.clone().step_by(chunks.query) {
                let q_end = (q_start + chunks.query).min(range.end);
                let last_query_pos = mask.query_offset + q_end - 1;

                for k_start in (0..block.len).step_by(chunks.key) {
                    // key tiles only move further into the future
                    if block.start + k_start > last_query_pos {
                        break;
                    }
                    let k_end = (k_start + chunks.key).min(block.len);
                    let tile = &mut scores[..k_end - k_start];

                    for qi in q_start..q_end {
                        let query_pos = mask.query_offset + qi;
                        let local = qi - range.start;

                        for h in 0..heads {
                            let q = &query[(b * q_len + qi) * row + h * head_dim..][..head_dim];

                            tile.iter_mut().enumerate().for_each(|(t, score)| {
                                let kj = k_start + t;
                                let key_pos = block.start + kj;
                                let k = &block.keys[(b * block.len + kj) * row + h * head_dim..][..head_dim];
                                let segment_ok = match (&block.segment_ids, mask.segments) {
                                    (Some(ids), Some((query_segments, _))) => {
                                        query_segments[b * q_len + qi] == ids[b * block.len + kj]
                                    }
                                    _ => true,
                                };
                                let visible =
                                    block.key_mask[b * block.len + kj] != 0 && key_pos <= query_pos && segment_ok;
                                *score = if visible { dot(q, k) * scale } else { f32::NEG_INFINITY };
                            });

                            let stat = local * heads + h;
                            let tile_max = tile.iter().fold(f32::NEG_INFINITY, |m, &s| m.max(s));
                            if tile_max == f32::NEG_INFINITY {
                                continue;
                            }
                            let new_max = max[stat].max(tile_max);
                            let correction = (max[stat] - new_max).exp();

                            let out = &mut acc[stat * head_dim..(stat + 1) * head_dim];
                            sum[stat] *= correction;
                            out.iter_mut().for_each(|o| *o *= correction);

                            for (t, &score) in tile.iter().enumerate() {
                                let kj = k_start + t;
                                let p = (score - new_max).exp();
                                sum[stat] += p;
                                let weight = match dropout {
                                    Some(dropout) => p * dropout.factor(b, h, query_pos, block.start + kj),
                                    None => p,
                                };
                                let v = &block.values[(b * block.len + kj) * row + h * head_dim..][..head_dim];
                                out.iter_mut().zip(v).for_each(|(o, &v)| *o += weight * v);
                            }

                            max[stat] = new_max;
                        }
                    }
                }
            }
        });
}

/// Per-call inputs shared by every layer of a forward pass.
#[derive(Debug, Clone, Copy)]
pub struct SequenceInputs<'a> {
    pub batch: usize,
    pub seq_len: usize,
    /// [batch, seq_len]
    pub attention_mask: &'a [u8],
    /// [batch, seq_len]
    pub segment_ids: &'a [i64],
    /// [batch, seq_len]
    pub position_ids: &'a [usize],
    /// [batch, seq_len]
    pub forget_mask: Option<&'a [bool]>,
}

/// Multi-head causal self-attention with rotary embeddings, optional KV cache,
/// and a switch between the standard and the chunked ring path.
pub struct Attention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub rotary: Arc<RotaryTable>,
    pub heads: usize,
    pub head_dim: usize,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
    pub scan_attention: bool,
    pub chunks: ChunkSizes,
    pub mesh: Arc<dyn MeshExecution>,
}

impl Attention {
    /// Chunked attention kicks in above this many queries.
    pub fn chunk_threshold(&self) -> usize {
        self.chunks.query.max(self.chunks.key)
    }

    /// Runs attention over `x` (`[batch, seq_len, hidden]`).
    ///
    /// With a cache the new keys/values are appended first and the queries
    /// attend over the whole cache buffer; segment ids and the forgetful
    /// mask apply only without a cache.
    pub fn forward(
        &self,
        x: &[f32],
        inputs: &SequenceInputs,
        cache: Option<&mut LayerCache>,
        stream: Option<DropoutStream>,
    ) -> Result<Vec<f32>> {
        let SequenceInputs { batch, seq_len, .. } = *inputs;

        let mut query = self.wq.forward(x);
        let mut key = self.wk.forward(x);
        let value = self.wv.forward(x);

        self.rotary.apply(&mut query, &mut key, inputs.position_ids)?;

        let dropout = stream
            .filter(|_| self.attn_pdrop > 0.0)
            .map(|stream| AttentionDropout { rate: self.attn_pdrop, stream: stream.fork(ATTENTION_WEIGHTS_SITE) });

        let use_chunked = self.scan_attention && seq_len > self.chunk_threshold();

        let attended = match cache {
            Some(cache) => {
                if cache.batch() != batch {
                    anyhow::bail!("Cache was allocated for batch {} but the input has batch {batch}", cache.batch());
                }
                let query_offset = cache.write(&key, &value, inputs.attention_mask, seq_len)?;
                let (keys, values, key_mask) = (cache.keys(), cache.values(), cache.key_mask());

                let dims = self.dims(batch, seq_len, cache.max_length());
                let mask = AttentionMask { query_offset, key_mask: &key_mask, segments: None, forget_mask: None };
                self.attend(&query, &keys, &values, dims, &mask, use_chunked, dropout)?
            }
            None => {
                let dims = self.dims(batch, seq_len, seq_len);
                let mask = AttentionMask {
                    query_offset: 0,
                    key_mask: inputs.attention_mask,
                    segments: Some((inputs.segment_ids, inputs.segment_ids)),
                    forget_mask: inputs.forget_mask,
                };
                self.attend(&query, &key, &value, dims, &mask, use_chunked, dropout)?
            }
        };

        let mut output = self.wo.forward(&attended);
        apply_dropout(&mut output, self.resid_pdrop, stream.map(|s| s.fork(ATTENTION_OUTPUT_SITE)));
        Ok(output)
    }

    fn dims(&self, batch: usize, q_len: usize, kv_len: usize) -> AttentionDims {
        AttentionDims { batch, q_len, kv_len, heads: self.heads, head_dim: self.head_dim }
    }

    #[allow(clippy::too_many_arguments)]
    fn attend(
        &self,
        query: &[f32],
        key: &[f32],
        value: &[f32],
        dims: AttentionDims,
        mask: &AttentionMask,
        use_chunked: bool,
        dropout: Option<AttentionDropout>,
    ) -> Result<Vec<f32>> {
        match use_chunked {
            true => ring_attention(query, key, value, dims, mask, self.chunks, self.mesh.as_ref(), dropout),
            false => Ok(standard_attention(query, key, value, dims, mask, dropout)),
        }
    }
}

impl std::fmt::Debug for Attention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attention")
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .field("scan_attention", &self.scan_attention)
            .field("chunks", &self.chunks)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}
