#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use std::{fmt, fs, path::Path};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Names of the mesh axes in the order they appear in `mesh_dim`.
pub const MESH_AXES: [&str; 4] = ["dp", "fsdp", "tp", "sp"];

/// Architecture hyperparameters of the hybrid model.
///
/// Deserialized from JSON with every field optional; missing fields take the
/// LLaMA-7B-like defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_sequence_length: usize,
    pub orig_sequence_length: usize,
    pub rms_norm_eps: f32,
    pub initializer_range: f32,
    pub use_cache: bool,
    pub bos_token_id: usize,
    pub eos_token_id: usize,
    pub resid_pdrop: f32,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub tie_word_embeddings: bool,
    pub scan_attention: bool,
    pub scan_mlp: bool,
    pub scan_query_chunk_size: usize,
    pub scan_key_chunk_size: usize,
    pub scan_mlp_chunk_size: usize,
    pub fcm_min_ratio: f32,
    pub fcm_max_ratio: f32,
    pub scan_layers: bool,
    pub param_scan_axis: usize,
    pub mesh_dim: Option<String>,
    pub theta: f32,
    pub num_ssm_stages: usize,
    pub ssm_state_size: usize,
    pub ssm_conv_kernel: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            max_sequence_length: 4096,
            orig_sequence_length: 4096,
            rms_norm_eps: 1e-6,
            initializer_range: 0.02,
            use_cache: true,
            bos_token_id: 0,
            eos_token_id: 1,
            resid_pdrop: 0.0,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            tie_word_embeddings: false,
            scan_attention: false,
            scan_mlp: false,
            scan_query_chunk_size: 1024,
            scan_key_chunk_size: 1024,
            scan_mlp_chunk_size: 1024,
            fcm_min_ratio: 0.0,
            fcm_max_ratio: 0.0,
            scan_layers: true,
            param_scan_axis: 0,
            mesh_dim: None,
            theta: 10000.0,
            num_ssm_stages: 3,
            ssm_state_size: 16,
            ssm_conv_kernel: 3,
        }
    }
}

impl ModelConfig {
    /// Returns one of the built-in size presets.
    pub fn preset(name: &str) -> Option<Self> {
        // (vocab, hidden, intermediate, layers, heads, max_len, eps)
        let (vocab_size, hidden_size, intermediate_size, num_hidden_layers, num_attention_heads, max_len, eps) =
            match name {
                "200m" => (32000, 1024, 2048, 14, 8, 2048, 1e-6),
                "1b" => (32000, 2048, 5504, 22, 16, 2048, 1e-6),
                "3b" => (32000, 3200, 8640, 26, 32, 2048, 1e-6),
                "7b" => (32000, 4096, 11008, 32, 32, 4096, 1e-6),
                "13b" => (32000, 5120, 13824, 40, 40, 2048, 1e-6),
                "30b" => (32000, 6656, 17920, 60, 52, 2048, 1e-6),
                "65b" => (32000, 8192, 22016, 80, 64, 2048, 1e-5),
                "debug" => (32000, 256, 256, 2, 2, 2048, 1e-6),
                _ => return None,
            };

        Some(Self {
            vocab_size,
            hidden_size,
            intermediate_size,
            num_hidden_layers,
            num_attention_heads,
            max_sequence_length: max_len,
            rms_norm_eps: eps,
            initializer_range: 0.02,
            use_cache: true,
            tie_word_embeddings: false,
            ..Self::default()
        })
    }

    /// Parses a JSON document, filling absent fields with defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(raw).context("Failed to parse model config JSON")?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize model config")
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Channel width inside a Mamba stage.
    pub fn ssm_inner_size(&self) -> usize {
        2 * self.hidden_size
    }

    /// Resolves `mesh_dim` against the number of available processing units.
    pub fn mesh_shape(&self, device_count: usize) -> Result<MeshShape> {
        match self.mesh_dim.as_deref() {
            Some(dims) => MeshShape::parse(dims, device_count),
            None => Ok(MeshShape::single()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("max_sequence_length", self.max_sequence_length),
            ("scan_query_chunk_size", self.scan_query_chunk_size),
            ("scan_key_chunk_size", self.scan_key_chunk_size),
            ("scan_mlp_chunk_size", self.scan_mlp_chunk_size),
            ("ssm_state_size", self.ssm_state_size),
            ("ssm_conv_kernel", self.ssm_conv_kernel),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!("Invalid {name}: must be positive, got {value}");
            }
        }

        if self.hidden_size % self.num_attention_heads != 0 {
            anyhow::bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }

        if self.head_dim() % 2 != 0 {
            anyhow::bail!("Rotary embedding needs an even head dimension, got {}", self.head_dim());
        }

        for (name, rate) in [
            ("resid_pdrop", self.resid_pdrop),
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
        ] {
            if !(0.0..1.0).contains(&rate) {
                anyhow::bail!("Invalid {name}: expected a rate in [0, 1), got {rate}");
            }
        }

        if !(0.0..=1.0).contains(&self.fcm_min_ratio)
            || !(0.0..=1.0).contains(&self.fcm_max_ratio)
            || self.fcm_min_ratio > self.fcm_max_ratio
        {
            anyhow::bail!(
                "Invalid forgetful causal mask ratios: min {} max {}",
                self.fcm_min_ratio,
                self.fcm_max_ratio
            );
        }

        if self.param_scan_axis > 1 {
            anyhow::bail!("Invalid scan_axis {}", self.param_scan_axis);
        }

        if let Some(dims) = self.mesh_dim.as_deref() {
            parse_mesh_dims(dims).with_context(|| format!("Invalid mesh_dim '{dims}'"))?;
        }

        Ok(())
    }
}

/// Loads a config from a preset name or a `scheme::path` reference.
///
/// Supported schemes: `json`. Anything else fails instead of falling back to defaults.
pub fn load_config(path: &str) -> Result<ModelConfig> {
    if let Some(config) = ModelConfig::preset(path) {
        info!("Using preset model config '{path}'");
        config.validate()?;
        return Ok(config);
    }

    let Some((load_type, load_path)) = path.split_once("::") else {
        anyhow::bail!("Unknown config '{path}': expected a preset name or '<type>::<path>'");
    };

    let config = match load_type {
        "json" => load_json_config(Path::new(load_path))?,
        _ => anyhow::bail!("Unsupported load config type: {load_type}"),
    };

    config.validate().with_context(|| format!("Invalid model configuration in {load_path}"))?;
    Ok(config)
}

fn load_json_config(path: &Path) -> Result<ModelConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = ModelConfig::from_json_str(&raw).with_context(|| format!("Invalid config in {}", path.display()))?;

    info!("Loaded model config from {}", path.display());
    debug!(
        "hidden_size={}, layers={}, heads={}, vocab={}, max_len={}",
        config.hidden_size,
        config.num_hidden_layers,
        config.num_attention_heads,
        config.vocab_size,
        config.max_sequence_length
    );

    Ok(config)
}

/// Processing-unit counts along the `dp`, `fsdp`, `tp` and `sp` axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshShape {
    pub dp: usize,
    pub fsdp: usize,
    pub tp: usize,
    pub sp: usize,
}

impl MeshShape {
    pub fn single() -> Self {
        Self { dp: 1, fsdp: 1, tp: 1, sp: 1 }
    }

    /// Parses `"dp,fsdp,tp,sp"`; one entry may be `-1` and is inferred from `device_count`.
    pub fn parse(dims: &str, device_count: usize) -> Result<Self> {
        let raw = parse_mesh_dims(dims)?;

        let known: usize = raw.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
        let fill = match raw.contains(&-1) {
            true if device_count % known != 0 => {
                anyhow::bail!("Cannot infer mesh dimension: {device_count} devices are not divisible by {known}")
            }
            true => device_count / known,
            false => 1,
        };

        let resolve = |d: i64| if d == -1 { fill } else { d as usize };
        Ok(Self { dp: resolve(raw[0]), fsdp: resolve(raw[1]), tp: resolve(raw[2]), sp: resolve(raw[3]) })
    }

    pub fn device_count(&self) -> usize {
        self.dp * self.fsdp * self.tp * self.sp
    }
}

/// Placement of one tensor dimension: replicated, or split over one or more mesh axes.
pub type Placement = Option<&'static [&'static str]>;

const FSDP_SP: &[&str] = &["fsdp", "sp"];
const TP: &[&str] = &["tp"];

/// Per-dimension placement of a parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec(pub Vec<Placement>);

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .0
            .iter()
            .map(|placement| match placement {
                None => "None".to_string(),
                Some([axis]) => axis.to_string(),
                Some(axes) => format!("({})", axes.join(", ")),
            })
            .collect::<Vec<_>>();
        write!(f, "PS({})", dims.join(", "))
    }
}

/// Ordered parameter-name pattern to placement mapping; the first match wins.
///
/// Patterns match as substrings of the dotted parameter name and may carry one
/// `{a,b,c}` alternation group. `*` matches everything.
#[derive(Debug, Clone)]
pub struct PartitionRules {
    rules: Vec<(&'static str, PartitionSpec)>,
}

impl PartitionRules {
    pub fn new(scan_layers: bool, scan_axis: usize) -> Result<Self> {
        let ps = |dims: &[Placement]| PartitionSpec(dims.to_vec());

        let (column, row, norm) = match (scan_layers, scan_axis) {
            (false, _) => (ps(&[Some(FSDP_SP), Some(TP)]), ps(&[Some(TP), Some(FSDP_SP)]), ps(&[None])),
            (true, 0) => (
                ps(&[None, Some(FSDP_SP), Some(TP)]),
                ps(&[None, Some(TP), Some(FSDP_SP)]),
                ps(&[None, None]),
            ),
            (true, 1) => (
                ps(&[Some(FSDP_SP), None, Some(TP)]),
                ps(&[Some(TP), None, Some(FSDP_SP)]),
                ps(&[None, None]),
            ),
            (true, axis) => anyhow::bail!("Invalid scan_axis {axis}"),
        };

        let rules = vec![
            ("transformer.wte.embedding", ps(&[Some(TP), Some(FSDP_SP)])),
            ("attention.{wq,wk,wv}.kernel", column.clone()),
            ("attention.wo.kernel", row.clone()),
            ("feed_forward.{w1,w3}.kernel", column),
            ("feed_forward.w2.kernel", row),
            ("attention_norm.kernel", norm.clone()),
            ("ffn_norm.kernel", norm),
            ("transformer.ln_f.kernel", ps(&[None])),
            ("lm_head.kernel", ps(&[Some(FSDP_SP), Some(TP)])),
            ("*", ps(&[None])),
        ];

        Ok(Self { rules })
    }

    /// Returns the placement of the first rule whose pattern matches `name`.
    pub fn resolve(&self, name: &str) -> &PartitionSpec {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, name))
            .map(|(_, spec)| spec)
            .unwrap_or(&self.rules[self.rules.len() - 1].1)
    }
}

/// Splits a mesh string into its four raw entries, `-1` meaning "infer".
fn parse_mesh_dims(dims: &str) -> Result<[i64; 4]> {
    let raw = dims
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<i64>().with_context(|| format!("Invalid mesh dimension '{part}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    let Ok(raw) = <[i64; 4]>::try_from(raw.as_slice()) else {
        anyhow::bail!("Expected {} mesh dimensions ({}), got {}", MESH_AXES.len(), MESH_AXES.join(","), raw.len());
    };

    let inferred = raw.iter().filter(|&&d| d == -1).count();
    if inferred > 1 {
        anyhow::bail!("At most one mesh dimension may be -1, got {inferred}");
    }
    if let Some(bad) = raw.iter().find(|&&d| d == 0 || d < -1) {
        anyhow::bail!("Mesh dimensions must be positive or -1, got {bad}");
    }

    Ok(raw)
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match (pattern.find('{'), pattern.find('}')) {
        (Some(open), Some(close)) if open < close => {
            let (prefix, suffix) = (&pattern[..open], &pattern[close + 1..]);
            pattern[open + 1..close]
                .split(',')
                .any(|alt| name.contains(&format!("{prefix}{alt}{suffix}")))
        }
        _ => name.contains(pattern),
    }
}
