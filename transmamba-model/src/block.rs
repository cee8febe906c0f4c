#[cfg(test)]
#[path = "../tests/unit/block_test.rs"]
mod block_test;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;

use crate::attention::{Attention, ChunkSizes, SequenceInputs};
use crate::cache::{LayerCache, ModelCache};
use crate::configuration::ModelConfig;
use crate::dropout::DropoutStream;
use crate::layers::{FeedForward, Linear, RMSNorm};
use crate::mesh::ExecutionContext;
use crate::params::{ParameterTree, SCAN_PREFIX, block_parameter_shapes, layer_prefix};
use crate::rotary::RotaryTable;

const ATTENTION_SITE: u64 = 1;
const FEED_FORWARD_SITE: u64 = 2;

/// Pre-norm transformer block
///
/// ```text
/// h'  = h  + Attention(RMSNorm(h))
/// h'' = h' + FeedForward(RMSNorm(h'))
/// ```
pub struct DecoderLayer {
    pub attention_norm: RMSNorm,
    pub attention: Attention,
    pub ffn_norm: RMSNorm,
    pub feed_forward: FeedForward,
}

impl DecoderLayer {
    /// Builds a layer from a tree holding its parameters under relative names
    /// (`attention.wq.kernel`, `ffn_norm.kernel`, ...).
    pub fn from_params(
        params: &ParameterTree,
        config: &ModelConfig,
        rotary: Arc<RotaryTable>,
        context: &ExecutionContext,
    ) -> Result<Self> {
        let (h, i, eps) = (config.hidden_size, config.intermediate_size, config.rms_norm_eps);
        let projection = |name: &str, input, output| Linear::from_params(params, name, input, output, false);

        let attention = Attention {
            wq: projection("attention.wq", h, h)?,
            wk: projection("attention.wk", h, h)?,
            wv: projection("attention.wv", h, h)?,
            wo: projection("attention.wo", h, h)?,
            rotary,
            heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            attn_pdrop: config.attn_pdrop,
            resid_pdrop: config.resid_pdrop,
            scan_attention: config.scan_attention,
            chunks: ChunkSizes { query: config.scan_query_chunk_size, key: config.scan_key_chunk_size },
            mesh: Arc::clone(&context.mesh),
        };

        let feed_forward = FeedForward::new(
            projection("feed_forward.w1", h, i)?,
            projection("feed_forward.w2", i, h)?,
            projection("feed_forward.w3", h, i)?,
            config.resid_pdrop,
            config.scan_mlp.then_some(config.scan_mlp_chunk_size),
        );

        Ok(Self {
            attention_norm: RMSNorm::from_params(params, "attention_norm.kernel", h, eps)?,
            attention,
            ffn_norm: RMSNorm::from_params(params, "ffn_norm.kernel", h, eps)?,
            feed_forward,
        })
    }

    pub fn forward(
        &self,
        mut hidden: Vec<f32>,
        inputs: &SequenceInputs,
        cache: Option<&mut LayerCache>,
        stream: Option<DropoutStream>,
    ) -> Result<Vec<f32>> {
        let normed = self.attention_norm.forward_rows(&hidden);
        let attended = self.attention.forward(&normed, inputs, cache, stream.map(|s| s.fork(ATTENTION_SITE)))?;
        hidden.iter_mut().zip(&attended).for_each(|(h, &a)| *h += a);

        let normed = self.ffn_norm.forward_rows(&hidden);
        let mixed = self.feed_forward.forward(&normed, inputs.seq_len, stream.map(|s| s.fork(FEED_FORWARD_SITE)));
        hidden.iter_mut().zip(&mixed).for_each(|(h, &m)| *h += m);

        Ok(hidden)
    }
}

impl std::fmt::Debug for DecoderLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("attention_norm", &self.attention_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

/// How the layer stack is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerIteration {
    /// Explicit loop over the layers.
    Unrolled,
    /// Fold carrying only the hidden state; parameters come from stacked tensors.
    Scanned,
}

/// Ordered per-layer records plus one block-apply function.
pub struct BlockCollection {
    layers: Vec<DecoderLayer>,
    iteration: LayerIteration,
}

impl BlockCollection {
    pub fn new(layers: Vec<DecoderLayer>, iteration: LayerIteration) -> Self {
        Self { layers, iteration }
    }

    /// Reads `transformer.h.{i}.*` or, with `scan_layers`, the stacked
    /// `transformer.h.scan.*` tensors split along `param_scan_axis`.
    pub fn from_params(
        params: &ParameterTree,
        config: &ModelConfig,
        rotary: Arc<RotaryTable>,
        context: &ExecutionContext,
    ) -> Result<Self> {
        let iteration = match config.scan_layers {
            true => LayerIteration::Scanned,
            false => LayerIteration::Unrolled,
        };
        let count = config.num_hidden_layers;
        let axis = config.param_scan_axis;
        if axis > 1 {
            anyhow::bail!("Invalid scan_axis {axis}");
        }

        let layers = (0..count)
            .map(|layer| {
                let mut local = ParameterTree::new();
                for (name, shape) in block_parameter_shapes(config) {
                    let tensor = match iteration {
                        LayerIteration::Unrolled => {
                            params.get_shaped(&format!("{}.{name}", layer_prefix(layer)), &shape)?.clone()
                        }
                        LayerIteration::Scanned => {
                            let mut stacked_shape = shape.clone();
                            stacked_shape.insert(axis.min(shape.len()), count);
                            params
                                .get_shaped(&format!("{SCAN_PREFIX}.{name}"), &stacked_shape)?
                                .unstack(axis.min(shape.len()), layer)?
                        }
                    };
                    local.insert(name, tensor);
                }
                DecoderLayer::from_params(&local, config, Arc::clone(&rotary), context)
                    .with_context(|| format!("Failed to build layer {layer}"))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Built {count} decoder layers ({iteration:?})");
        Ok(Self::new(layers, iteration))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iteration(&self) -> LayerIteration {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: LayerIteration) {
        self.iteration = iteration;
    }

    pub fn forward(
        &self,
        hidden: Vec<f32>,
        inputs: &SequenceInputs,
        cache: Option<&mut ModelCache>,
        stream: Option<DropoutStream>,
    ) -> Result<Vec<f32>> {
        let mut caches: Vec<Option<&mut LayerCache>> = match cache {
            Some(cache) if cache.layers.len() != self.layers.len() => {
                anyhow::bail!("Cache has {} layers, model has {}", cache.layers.len(), self.layers.len())
            }
            Some(cache) => cache.layers.iter_mut().map(Some).collect(),
            None => self.layers.iter().map(|_| None).collect(),
        };
        let layer_stream = |idx: usize| stream.map(|s| s.fork(idx as u64));

        match self.iteration {
            LayerIteration::Unrolled => {
                let mut hidden = hidden;
                for (idx, layer) in self.layers.iter().enumerate() {
                    hidden = layer.forward(hidden, inputs, caches[idx].as_deref_mut(), layer_stream(idx))?;
                }
                Ok(hidden)
            }
            LayerIteration::Scanned => self
                .layers
                .iter()
                .zip(caches)
                .enumerate()
                .try_fold(hidden, |carry, (idx, (layer, cache))| {
                    layer.forward(carry, inputs, cache, layer_stream(idx))
                }),
        }
    }
}

impl std::fmt::Debug for BlockCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCollection")
            .field("layers", &self.layers.len())
            .field("iteration", &self.iteration)
            .field("first", &self.layers.first())
            .finish()
    }
}
