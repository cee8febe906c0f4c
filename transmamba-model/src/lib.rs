//! Hybrid attention/state-space causal language model.
//!
//! A stack of pre-norm transformer blocks with rotary embeddings, a sharded
//! KV cache and ring (blockwise) attention, followed by selective state-space
//! (Mamba) stages and a vocabulary head.

pub mod attention;
pub mod block;
pub mod cache;
pub mod configuration;
pub mod dropout;
pub mod generation;
pub mod layers;
pub mod mamba;
pub mod mesh;
pub mod models;
pub mod params;
pub mod rotary;
pub mod sampler;
pub mod ssm;
pub mod tensor;

use anyhow::Result;
use log::debug;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::cache::{LayerCache, ModelCache};
pub use crate::configuration::{MeshShape, ModelConfig, PartitionRules, PartitionSpec, load_config};
pub use crate::generation::{DecodeState, GenerationLimits, generate, prepare_inputs, update_inputs};
pub use crate::mesh::{ExecutionContext, LocalRing, MeshExecution, SingleDevice};
pub use crate::models::{ModelInput, ModelOutput, TransformerBuilder, TransmambaForCausalLm};
pub use crate::params::ParameterTree;
pub use crate::sampler::Sampler;
pub use crate::ssm::ScanMode;

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Preset name or `json::<file>`.
    pub model_config: String,
    /// Directory of safetensors files; random parameters when absent.
    pub checkpoint_path: Option<String>,
    pub prompt_ids: Vec<u32>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: usize,
    pub max_sequence_length: Option<usize>,
    pub seed: u64,
}

impl GenerationConfig {
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct GenerationConfigBuilder {
    model_config: Option<String>,
    checkpoint_path: Option<String>,
    prompt_ids: Option<Vec<u32>>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_new_tokens: Option<usize>,
    max_sequence_length: Option<usize>,
    seed: Option<u64>,
}

impl GenerationConfigBuilder {
    pub fn model_config(mut self, config: Option<&String>) -> Self {
        self.model_config = config.cloned();
        self
    }
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn prompt_ids(mut self, ids: Option<Vec<u32>>) -> Self {
        self.prompt_ids = ids;
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
    pub fn max_new_tokens(mut self, count: Option<usize>) -> Self {
        self.max_new_tokens = count;
        self
    }
    pub fn max_sequence_length(mut self, length: Option<usize>) -> Self {
        self.max_sequence_length = length;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<GenerationConfig, String> {
        let prompt_ids = self.prompt_ids.ok_or("prompt_ids is required")?;
        if prompt_ids.is_empty() {
            return Err("prompt_ids must not be empty".to_string());
        }

        Ok(GenerationConfig {
            model_config: self.model_config.unwrap_or_else(|| "debug".to_string()),
            checkpoint_path: self.checkpoint_path,
            prompt_ids,
            temperature: self.temperature.unwrap_or(1.0),
            top_p: self.top_p.unwrap_or(0.9),
            max_new_tokens: self.max_new_tokens.unwrap_or(32),
            max_sequence_length: self.max_sequence_length,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Builds the model and samples a continuation of a single prompt.
pub fn run_generation(generation_config: GenerationConfig) -> Result<Vec<u32>> {
    debug!("{generation_config:#?}");

    let config = load_config(&generation_config.model_config)?;
    let mut builder =
        TransformerBuilder::new(config).with_max_sequence_length(generation_config.max_sequence_length);
    builder = match &generation_config.checkpoint_path {
        Some(path) => builder.with_checkpoint(path),
        None => builder.with_random_init(generation_config.seed),
    };
    let model = builder.build()?;

    debug!("{model:#?}");

    let vocab_size = model.config().vocab_size;
    if let Some(bad) = generation_config.prompt_ids.iter().find(|&&id| id as usize >= vocab_size) {
        anyhow::bail!("Prompt token {bad} is outside the vocabulary of {vocab_size}");
    }

    let mut sampler =
        Sampler::new(vocab_size, generation_config.temperature, generation_config.top_p, generation_config.seed)?;
    let limits = GenerationLimits {
        max_new_tokens: generation_config.max_new_tokens,
        eos_token_id: Some(model.config().eos_token_id as u32),
    };

    let mut rows = generate(&model, &mut sampler, &generation_config.prompt_ids, 1, None, limits)?;
    Ok(rows.pop().unwrap_or_default())
}
