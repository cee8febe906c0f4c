use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use crate::configuration::ModelConfig;
use crate::mesh::ExecutionContext;
use crate::params::ParameterTree;
use crate::ssm::ScanMode;

mod transmamba;

pub use transmamba::{ModelInput, ModelOutput, TransmambaForCausalLm, default_position_ids, forgetful_causal_mask};

/// Where the model parameters come from.
#[derive(Debug, Clone)]
enum ParameterSource {
    /// Directory of `*.safetensors` files.
    Checkpoint(PathBuf),
    /// Random initialization with the given seed.
    Random(u64),
}

/// Builder pattern for creating the causal LM
pub struct TransformerBuilder {
    config: ModelConfig,
    source: ParameterSource,
    context: Option<ExecutionContext>,
    scan_mode: ScanMode,
    max_sequence_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            source: ParameterSource::Random(0),
            context: None,
            scan_mode: ScanMode::default(),
            max_sequence_length: None,
        }
    }

    pub fn with_checkpoint(mut self, dir: impl AsRef<Path>) -> Self {
        self.source = ParameterSource::Checkpoint(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_random_init(mut self, seed: u64) -> Self {
        self.source = ParameterSource::Random(seed);
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_scan_mode(mut self, scan_mode: ScanMode) -> Self {
        self.scan_mode = scan_mode;
        self
    }

    /// Caps the rotary table and cache length below the configured maximum.
    pub fn with_max_sequence_length(mut self, length: Option<usize>) -> Self {
        self.max_sequence_length = length;
        self
    }

    pub fn build(self) -> Result<TransmambaForCausalLm> {
        let mut config = self.config;
        if let Some(length) = self.max_sequence_length {
            config.max_sequence_length = length.min(config.max_sequence_length);
        }

        let context = match self.context {
            Some(context) => context,
            None => ExecutionContext::from_config(&config)?,
        };

        let params = match &self.source {
            ParameterSource::Checkpoint(dir) => ParameterTree::load_safetensors(dir)
                .with_context(|| format!("Failed to load checkpoint: {}", dir.display()))?,
            ParameterSource::Random(seed) => ParameterTree::init_random(&config, *seed)?,
        };
        info!("Loaded {} parameter tensors from {:?}", params.len(), self.source);

        TransmambaForCausalLm::new(config, &params, context, self.scan_mode)
    }

    /// Builds from an already materialized parameter tree.
    pub fn build_with_params(self, params: &ParameterTree) -> Result<TransmambaForCausalLm> {
        let mut config = self.config;
        if let Some(length) = self.max_sequence_length {
            config.max_sequence_length = length.min(config.max_sequence_length);
        }

        let context = match self.context {
            Some(context) => context,
            None => ExecutionContext::from_config(&config)?,
        };
        TransmambaForCausalLm::new(config, params, context, self.scan_mode)
    }
}
