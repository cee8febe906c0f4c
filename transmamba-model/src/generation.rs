use std::time::Instant;

use anyhow::Result;
use log::{debug, info};

use crate::cache::ModelCache;
use crate::models::{ModelInput, TransmambaForCausalLm, default_position_ids};
use crate::sampler::Sampler;

/// Cache and positions carried across the calls of one decoding session.
#[derive(Debug)]
pub struct DecodeState {
    pub cache: ModelCache,
    /// `[batch, len]` positions of the tokens fed in the next call.
    pub position_ids: Vec<usize>,
    pub batch: usize,
}

/// Allocates the session cache and derives the prompt positions.
///
/// With an attention mask, positions are `max(cumsum(mask) - 1, 0)` so left
/// padded prompts start at 0; without one they are `0..seq_len`. `max_length`
/// is rounded up to a multiple of the sequence-parallel size.
pub fn prepare_inputs(
    model: &TransmambaForCausalLm,
    batch: usize,
    seq_len: usize,
    attention_mask: Option<&[u8]>,
    max_length: usize,
) -> Result<DecodeState> {
    if max_length < seq_len {
        anyhow::bail!("max_length {max_length} is shorter than the prompt ({seq_len} tokens)");
    }

    let sp = model.sequence_parallel_size();
    let cache = model.init_cache(batch, max_length.div_ceil(sp) * sp)?;

    let position_ids = match attention_mask {
        Some(mask) => default_position_ids(mask, seq_len),
        None => (0..batch).flat_map(|_| 0..seq_len).collect(),
    };

    Ok(DecodeState { cache, position_ids, batch })
}

/// Moves to the next single-token step: each row continues from its last position.
pub fn update_inputs(state: &mut DecodeState) {
    let len = state.position_ids.len() / state.batch.max(1);
    state.position_ids = state.position_ids.chunks(len.max(1)).map(|row| row.last().map_or(0, |&p| p + 1)).collect();
}

/// Stop conditions of a generation run.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_new_tokens: usize,
    pub eos_token_id: Option<u32>,
}

/// Generates continuations for a batch of equally long (left padded) prompts.
///
/// Runs one prefill call and then one call per new token. A row that emits
/// `eos_token_id` is finished; its later slots are filled with that id. The
/// returned rows hold only the new tokens.
pub fn generate(
    model: &TransmambaForCausalLm,
    sampler: &mut Sampler,
    prompt: &[u32],
    batch: usize,
    attention_mask: Option<&[u8]>,
    limits: GenerationLimits,
) -> Result<Vec<Vec<u32>>> {
    if batch == 0 || prompt.is_empty() || prompt.len() % batch != 0 {
        anyhow::bail!("Prompt of {} tokens cannot be split into {batch} rows", prompt.len());
    }
    let seq_len = prompt.len() / batch;
    let mut generated = vec![Vec::with_capacity(limits.max_new_tokens); batch];
    if limits.max_new_tokens == 0 {
        return Ok(generated);
    }

    let mut state = prepare_inputs(model, batch, seq_len, attention_mask, seq_len + limits.max_new_tokens)?;
    let mut metrics = TokenMetrics::new();
    let mut finished = vec![false; batch];

    let mut input = ModelInput::new(prompt, batch, seq_len).with_position_ids(&state.position_ids);
    if let Some(mask) = attention_mask {
        input = input.with_attention_mask(mask);
    }
    let output = model.forward(&input, Some(&mut state.cache))?;
    debug!("Prefilled {batch} x {seq_len} prompt tokens");

    let mut next = (0..batch).map(|b| sampler.sample(output.position(b, seq_len - 1))).collect::<Vec<_>>();

    loop {
        metrics.start_generation();
        for (b, &token) in next.iter().enumerate() {
            generated[b].push(token);
            finished[b] |= limits.eos_token_id == Some(token);
        }
        metrics.increment_token();

        if generated[0].len() >= limits.max_new_tokens || finished.iter().all(|&done| done) {
            break;
        }

        update_inputs(&mut state);
        let input = ModelInput::new(&next, batch, 1).with_position_ids(&state.position_ids);
        let output = model.forward(&input, Some(&mut state.cache))?;

        next = (0..batch)
            .map(|b| match (finished[b], limits.eos_token_id) {
                (true, Some(eos)) => eos,
                _ => sampler.sample(output.position(b, 0)),
            })
            .collect();
    }

    metrics.report();
    Ok(generated)
}

/// Tracks token generation throughput
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed().as_secs_f64();
            if self.generated_count > 0 && duration > 0.0 {
                info!(
                    "Generated {} steps in {duration:.2}s - {:.2} steps/sec",
                    self.generated_count,
                    self.generated_count as f64 / duration
                );
            }
        }
        self.generated_count = 0;
    }
}
