#[cfg(test)]
#[path = "../tests/unit/params_test.rs"]
mod params_test;

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use memmap2::Mmap;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::configuration::ModelConfig;
use crate::tensor::Tensor;

/// Prefix of the stacked block parameters when layers are scanned.
pub const SCAN_PREFIX: &str = "transformer.h.scan";

/// Prefix of the unrolled block parameters for `layer`.
pub fn layer_prefix(layer: usize) -> String {
    format!("transformer.h.{layer}")
}

/// Prefix of the Mamba stage `stage` (zero based, named `m1`, `m2`, ...).
pub fn ssm_stage_prefix(stage: usize) -> String {
    format!("transformer.m{}", stage + 1)
}

/// Per-layer parameter names (relative to the layer prefix) and shapes.
pub fn block_parameter_shapes(config: &ModelConfig) -> Vec<(&'static str, Vec<usize>)> {
    let (h, i) = (config.hidden_size, config.intermediate_size);
    vec![
        ("attention_norm.kernel", vec![h]),
        ("attention.wq.kernel", vec![h, h]),
        ("attention.wk.kernel", vec![h, h]),
        ("attention.wv.kernel", vec![h, h]),
        ("attention.wo.kernel", vec![h, h]),
        ("ffn_norm.kernel", vec![h]),
        ("feed_forward.w1.kernel", vec![i, h]),
        ("feed_forward.w2.kernel", vec![h, i]),
        ("feed_forward.w3.kernel", vec![i, h]),
    ]
}

/// Mamba stage parameter names (relative to the stage prefix) and shapes.
pub fn ssm_parameter_shapes(config: &ModelConfig) -> Vec<(&'static str, Vec<usize>)> {
    let (h, c, n, k) = (config.hidden_size, config.ssm_inner_size(), config.ssm_state_size, config.ssm_conv_kernel);
    vec![
        ("norm.kernel", vec![h]),
        ("inp_proj.kernel", vec![c, h]),
        ("inp_proj.bias", vec![c]),
        ("conv.kernel", vec![c, k]),
        ("conv.bias", vec![c]),
        ("s6.fc_delta.kernel", vec![c, c]),
        ("s6.fc_delta.bias", vec![c]),
        ("s6.fc_b.kernel", vec![n, c]),
        ("s6.fc_b.bias", vec![n]),
        ("s6.fc_c.kernel", vec![n, c]),
        ("s6.fc_c.bias", vec![n]),
        ("s6.a_log", vec![c, n]),
        ("d_proj.kernel", vec![c, h]),
        ("d_proj.bias", vec![c]),
        ("out_proj.kernel", vec![h, c]),
        ("out_proj.bias", vec![h]),
    ]
}

/// Model-level (non block, non stage) parameter names and shapes.
pub fn top_level_parameter_shapes(config: &ModelConfig) -> Vec<(&'static str, Vec<usize>)> {
    let (v, h) = (config.vocab_size, config.hidden_size);
    let mut shapes = vec![
        ("transformer.wte.embedding", vec![v, h]),
        ("transformer.final_proj.kernel", vec![h, h]),
        ("transformer.final_proj.bias", vec![h]),
        ("transformer.ln_f.kernel", vec![h]),
    ];
    if !config.tie_word_embeddings {
        shapes.push(("lm_head.kernel", vec![v, h]));
    }
    shapes
}

/// Full names and shapes of every parameter `config` expects, without allocating them.
///
/// Scanned block parameters carry the layer axis at `param_scan_axis`.
pub fn parameter_layout(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let mut layout = top_level_parameter_shapes(config)
        .into_iter()
        .map(|(name, shape)| (name.to_string(), shape))
        .collect::<Vec<_>>();

    for (name, mut shape) in block_parameter_shapes(config) {
        if config.scan_layers {
            shape.insert(config.param_scan_axis.min(shape.len()), config.num_hidden_layers);
            layout.push((format!("{SCAN_PREFIX}.{name}"), shape));
        } else {
            layout.extend(
                (0..config.num_hidden_layers).map(|layer| (format!("{}.{name}", layer_prefix(layer)), shape.clone())),
            );
        }
    }

    for stage in 0..config.num_ssm_stages {
        let prefix = ssm_stage_prefix(stage);
        layout.extend(ssm_parameter_shapes(config).into_iter().map(|(name, shape)| (format!("{prefix}.{name}"), shape)));
    }

    layout
}

/// Hierarchical (dotted) name to tensor mapping holding every model weight.
#[derive(Clone, Default)]
pub struct ParameterTree {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors.get(name).with_context(|| format!("Missing parameter: {name}"))
    }

    /// Looks up a parameter and checks its shape.
    pub fn get_shaped(&self, name: &str, shape: &[usize]) -> Result<&Tensor> {
        let tensor = self.get(name)?;
        if tensor.shape() != shape {
            anyhow::bail!("Parameter {name} has shape {:?}, expected {:?}", tensor.shape(), shape);
        }
        Ok(tensor)
    }

    /// Loads every tensor of every `*.safetensors` file in `dir`, converting to f32.
    pub fn load_safetensors(dir: &Path) -> Result<Self> {
        let mut files = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<PathBuf>>();
        files.sort();

        if files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", dir.display());
        }

        info!("Found {} safetensor files", files.len());

        let mut tree = ParameterTree::new();
        for path in &files {
            let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
            // SAFETY: the mapping is only read while `file` is open and it is not modified by this process.
            let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?;
            let safetensors =
                SafeTensors::deserialize(&mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;

            for (name, view) in safetensors.tensors() {
                if tree.contains(&name) {
                    anyhow::bail!("Parameter {name} is defined twice (last seen in {})", path.display());
                }
                let data = convert_to_f32(&view, &name)?;
                tree.insert(name, Tensor::new(data, view.shape().to_vec())?);
            }
        }

        info!("Loaded {} parameters", tree.len());
        Ok(tree)
    }

    /// Writes all parameters as F32 into a single safetensors file.
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let buffers = self
            .tensors
            .iter()
            .map(|(name, tensor)| {
                let mut bytes = vec![0u8; tensor.numel() * 4];
                LittleEndian::write_f32_into(tensor.as_slice(), &mut bytes);
                (name.clone(), tensor.shape().to_vec(), bytes)
            })
            .collect::<Vec<_>>();

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .with_context(|| format!("Failed to create view for {name}"))
                    .map(|view| (name.clone(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize_to_file(views, &None, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Saved {} parameters to {}", self.len(), path.display());
        Ok(())
    }

    /// Creates a freshly initialized parameter tree for `config`.
    ///
    /// Dense weights are drawn from `N(0, initializer_range)`, norm scales start at one,
    /// `A_log` follows the S4D-real layout `ln(1..=state)` and the Mamba output bias starts at one.
    pub fn init_random(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut tree = ParameterTree::new();
        let std = config.initializer_range;

        for (name, shape) in top_level_parameter_shapes(config) {
            tree.insert(name, init_tensor(name, &shape, std, &mut rng)?);
        }

        let layers = (0..config.num_hidden_layers)
            .map(|_| {
                block_parameter_shapes(config)
                    .into_iter()
                    .map(|(name, shape)| Ok((name, init_tensor(name, &shape, std, &mut rng)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        if config.scan_layers {
            for (idx, (name, _)) in block_parameter_shapes(config).iter().enumerate() {
                let parts = layers.iter().map(|layer| layer[idx].1.clone()).collect::<Vec<_>>();
                tree.insert(format!("{SCAN_PREFIX}.{name}"), Tensor::stack(&parts, config.param_scan_axis)?);
            }
        } else {
            for (layer, params) in layers.into_iter().enumerate() {
                for (name, tensor) in params {
                    tree.insert(format!("{}.{name}", layer_prefix(layer)), tensor);
                }
            }
        }

        for stage in 0..config.num_ssm_stages {
            for (name, shape) in ssm_parameter_shapes(config) {
                tree.insert(format!("{}.{name}", ssm_stage_prefix(stage)), init_tensor(name, &shape, std, &mut rng)?);
            }
        }

        debug!("Initialized {} parameters with seed {seed}", tree.len());
        Ok(tree)
    }
}

impl std::fmt::Debug for ParameterTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterTree")
            .field("tensors", &self.tensors.len())
            .field("elements", &self.tensors.values().map(Tensor::numel).sum::<usize>())
            .finish()
    }
}

fn init_tensor(name: &str, shape: &[usize], std: f32, rng: &mut StdRng) -> Result<Tensor> {
    let tensor = if name.ends_with("norm.kernel") || name.ends_with("ln_f.kernel") {
        Tensor::filled(shape, 1.0)
    } else if name.ends_with("out_proj.bias") {
        Tensor::filled(shape, 1.0)
    } else if name.ends_with(".bias") {
        Tensor::zeros(shape)
    } else if name.ends_with("a_log") {
        let state = shape[shape.len() - 1];
        let row = (1..=state).map(|n| (n as f32).ln()).collect::<Vec<_>>();
        Tensor::new(row.repeat(shape[0]), shape.to_vec())?
    } else {
        let normal = Normal::new(0.0, std).with_context(|| format!("Invalid init std {std} for '{name}'"))?;
        let data = (0..shape.iter().product::<usize>()).map(|_| normal.sample(&mut *rng)).collect();
        Tensor::new(data, shape.to_vec())?
    };
    Ok(tensor)
}

fn convert_to_f32(view: &TensorView, name: &str) -> Result<Vec<f32>> {
    let data = view.data();
    let elements = view.shape().iter().product::<usize>();

    match view.dtype() {
        Dtype::F32 => {
            validate_size(data.len(), elements * 4, name, "F32")?;
            let mut out = vec![0.0f32; elements];
            LittleEndian::read_f32_into(data, &mut out);
            Ok(out)
        }
        Dtype::BF16 => {
            validate_size(data.len(), elements * 2, name, "BF16")?;
            let mut bits = vec![0u16; elements];
            LittleEndian::read_u16_into(data, &mut bits);
            // BF16 is the upper half of an f32
            Ok(bits.into_iter().map(|b| f32::from_bits((b as u32) << 16)).collect())
        }
        dtype => anyhow::bail!("Unsupported tensor dtype {dtype:?} for {name}"),
    }
}

fn validate_size(actual: usize, expected: usize, name: &str, dtype: &str) -> Result<()> {
    if actual != expected {
        anyhow::bail!("{dtype} tensor {name} size mismatch. Expected {expected} bytes, got {actual}");
    }
    Ok(())
}
