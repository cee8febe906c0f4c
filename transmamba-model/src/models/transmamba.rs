use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use rand::{Rng, rngs::StdRng};

use crate::attention::SequenceInputs;
use crate::block::BlockCollection;
use crate::cache::ModelCache;
use crate::configuration::ModelConfig;
use crate::dropout::{DropoutStream, apply_dropout};
use crate::layers::{Linear, RMSNorm, TokenEmbedding};
use crate::mamba::MambaBlock;
use crate::mesh::ExecutionContext;
use crate::params::{ParameterTree, ssm_stage_prefix};
use crate::rotary::RotaryTable;
use crate::ssm::ScanMode;

const EMBEDDING_SITE: u64 = 101;
const FORGET_MASK_SITE: u64 = 102;
const BLOCKS_SITE: u64 = 103;

/// Inputs of one forward call; all per-token tensors are `[batch, seq_len]`.
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    pub input_ids: &'a [u32],
    pub batch: usize,
    pub seq_len: usize,
    pub attention_mask: Option<&'a [u8]>,
    pub segment_ids: Option<&'a [i64]>,
    pub position_ids: Option<&'a [usize]>,
    /// Disables dropout and the forgetful mask.
    pub deterministic: bool,
    /// Seed of the call-scoped dropout stream, used when not deterministic.
    pub dropout_seed: u64,
}

impl<'a> ModelInput<'a> {
    pub fn new(input_ids: &'a [u32], batch: usize, seq_len: usize) -> Self {
        Self {
            input_ids,
            batch,
            seq_len,
            attention_mask: None,
            segment_ids: None,
            position_ids: None,
            deterministic: true,
            dropout_seed: 0,
        }
    }

    pub fn with_attention_mask(mut self, mask: &'a [u8]) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_segment_ids(mut self, segment_ids: &'a [i64]) -> Self {
        self.segment_ids = Some(segment_ids);
        self
    }

    pub fn with_position_ids(mut self, position_ids: &'a [usize]) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    /// Enables dropout with the given seed.
    pub fn with_dropout(mut self, seed: u64) -> Self {
        self.deterministic = false;
        self.dropout_seed = seed;
        self
    }
}

/// Vocabulary logits, `[batch, seq_len, vocab_size]`.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Vec<f32>,
    pub batch: usize,
    pub seq_len: usize,
    pub vocab_size: usize,
}

impl ModelOutput {
    /// Logits of one position.
    pub fn position(&self, b: usize, t: usize) -> &[f32] {
        let start = (b * self.seq_len + t) * self.vocab_size;
        &self.logits[start..start + self.vocab_size]
    }
}

/// Hybrid causal language model
///
/// ```text
/// ids → embedding → decoder layers → Mamba stages → final_proj → ln_f → lm_head
/// ```
pub struct TransmambaForCausalLm {
    config: ModelConfig,
    context: ExecutionContext,
    embedding: TokenEmbedding,
    blocks: BlockCollection,
    ssm_stages: Vec<MambaBlock>,
    final_proj: Linear,
    ln_f: RMSNorm,
    lm_head: Linear,
}

impl TransmambaForCausalLm {
    pub fn new(
        config: ModelConfig,
        params: &ParameterTree,
        context: ExecutionContext,
        scan_mode: ScanMode,
    ) -> Result<Self> {
        config.validate()?;
        let (v, h) = (config.vocab_size, config.hidden_size);

        let embedding_table = params.get_shaped("transformer.wte.embedding", &[v, h])?.as_slice().to_vec();
        let rotary = Arc::new(RotaryTable::new(config.head_dim(), config.max_sequence_length, config.theta));

        let blocks = BlockCollection::from_params(params, &config, rotary, &context)?;

        let ssm_stages = (0..config.num_ssm_stages)
            .map(|stage| {
                let prefix = ssm_stage_prefix(stage);
                MambaBlock::from_params(params, &prefix, &config, scan_mode)
                    .with_context(|| format!("Failed to build Mamba stage {prefix}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let lm_head = match config.tie_word_embeddings {
            true => Linear::new(embedding_table.clone(), None, h, v),
            false => Linear::from_params(params, "lm_head", h, v, false)?,
        };

        Ok(Self {
            embedding: TokenEmbedding::new(embedding_table, h),
            blocks,
            ssm_stages,
            final_proj: Linear::from_params(params, "transformer.final_proj", h, h, true)?,
            ln_f: RMSNorm::from_params(params, "transformer.ln_f.kernel", h, config.rms_norm_eps)?,
            lm_head,
            context,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn sequence_parallel_size(&self) -> usize {
        self.context.sequence_parallel_size()
    }

    pub fn blocks(&self) -> &BlockCollection {
        &self.blocks
    }

    /// Allocates a zeroed cache for a decoding session of up to `max_length` positions.
    pub fn init_cache(&self, batch: usize, max_length: usize) -> Result<ModelCache> {
        if max_length > self.config.max_sequence_length {
            anyhow::bail!(
                "Cache length {max_length} exceeds max_sequence_length {}",
                self.config.max_sequence_length
            );
        }
        ModelCache::new(&self.config, batch, max_length, &self.context)
    }

    /// Full forward pass producing vocabulary logits.
    pub fn forward(&self, input: &ModelInput, cache: Option<&mut ModelCache>) -> Result<ModelOutput> {
        let hidden = self.hidden_states(input, cache)?;
        let logits = self.lm_head.forward(&hidden);

        Ok(ModelOutput { logits, batch: input.batch, seq_len: input.seq_len, vocab_size: self.config.vocab_size })
    }

    /// Final normalized hidden states, `[batch, seq_len, hidden]`.
    pub fn hidden_states(&self, input: &ModelInput, cache: Option<&mut ModelCache>) -> Result<Vec<f32>> {
        let ModelInput { batch, seq_len, .. } = *input;
        let tokens = batch * seq_len;

        if tokens == 0 {
            anyhow::bail!("Forward call needs at least one token, got batch {batch} x {seq_len}");
        }
        if input.input_ids.len() != tokens {
            anyhow::bail!("input_ids has {} entries, expected {batch} x {seq_len}", input.input_ids.len());
        }

        let attention_mask = match input.attention_mask {
            Some(mask) => checked_len(mask, tokens, "attention_mask")?.to_vec(),
            None => vec![1; tokens],
        };
        let segment_ids = match input.segment_ids {
            Some(ids) => checked_len(ids, tokens, "segment_ids")?.to_vec(),
            None => vec![0; tokens],
        };
        let position_ids = match (input.position_ids, cache.is_some()) {
            (Some(ids), _) => checked_len(ids, tokens, "position_ids")?.to_vec(),
            (None, true) => anyhow::bail!("position_ids must be provided when decoding with a cache"),
            (None, false) => default_position_ids(&attention_mask, seq_len),
        };

        let stream = (!input.deterministic).then(|| DropoutStream::new(input.dropout_seed));
        let forget_mask = match stream {
            Some(stream) if self.config.fcm_max_ratio > 0.0 && cache.is_none() => Some(forgetful_causal_mask(
                &mut stream.fork(FORGET_MASK_SITE).rng(),
                batch,
                seq_len,
                self.config.fcm_min_ratio,
                self.config.fcm_max_ratio,
            )),
            _ => None,
        };

        let mut hidden = self.embedding.forward(input.input_ids)?;
        apply_dropout(&mut hidden, self.config.embd_pdrop, stream.map(|s| s.fork(EMBEDDING_SITE)));

        let inputs = SequenceInputs {
            batch,
            seq_len,
            attention_mask: &attention_mask,
            segment_ids: &segment_ids,
            position_ids: &position_ids,
            forget_mask: forget_mask.as_deref(),
        };

        let mut hidden = self.blocks.forward(hidden, &inputs, cache, stream.map(|s| s.fork(BLOCKS_SITE)))?;

        for stage in &self.ssm_stages {
            hidden = stage.forward(&hidden, Some(&attention_mask), batch, seq_len)?;
        }

        let hidden = self.final_proj.forward(&hidden);
        debug!("Forward pass over batch {batch} x {seq_len} done");
        Ok(self.ln_f.forward_rows(&hidden))
    }
}

impl std::fmt::Debug for TransmambaForCausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmambaForCausalLm")
            .field("config", &self.config)
            .field("sequence_parallel", &self.context.sequence_parallel_size())
            .field("embedding", &self.embedding)
            .field("blocks", &self.blocks)
            .field("ssm_stages", &self.ssm_stages.len())
            .field("lm_head", &self.lm_head)
            .finish()
    }
}

fn checked_len<'a, T>(values: &'a [T], expected: usize, name: &str) -> Result<&'a [T]> {
    if values.len() != expected {
        anyhow::bail!("{name} has {} entries, expected {expected}", values.len());
    }
    Ok(values)
}

/// `max(cumsum(mask) - 1, 0)` per row, so left padding does not shift positions.
pub fn default_position_ids(attention_mask: &[u8], seq_len: usize) -> Vec<usize> {
    attention_mask
        .chunks(seq_len)
        .flat_map(|row| {
            row.iter().scan(0usize, |seen, &m| {
                *seen += m as usize;
                Some(seen.saturating_sub(1))
            })
        })
        .collect()
}

/// Random `[batch, seq_len, seq_len]` query/key mask: each pair is hidden with a
/// per-example probability drawn uniformly from `[min_ratio, max_ratio]`.
/// Key 0 stays visible to every query. `true` keeps.
pub fn forgetful_causal_mask(rng: &mut StdRng, batch: usize, seq_len: usize, min_ratio: f32, max_ratio: f32) -> Vec<bool> {
    let ratios = (0..batch)
        .map(|_| if max_ratio > min_ratio { rng.gen_range(min_ratio..=max_ratio) } else { max_ratio })
        .collect::<Vec<_>>();

    ratios
        .into_iter()
        .flat_map(|ratio| (0..seq_len * seq_len).map(move |pair| (pair, ratio)))
        .map(|(pair, ratio)| pair % seq_len == 0 || rng.gen_range(0.0f32..1.0) > ratio)
        .collect()
}
