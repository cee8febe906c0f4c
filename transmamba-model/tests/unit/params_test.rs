use super::*;
use anyhow::Result;
use tempfile::TempDir;

fn small_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_size: 8,
        intermediate_size: 12,
        num_hidden_layers: 3,
        num_attention_heads: 2,
        max_sequence_length: 32,
        ssm_state_size: 4,
        ..ModelConfig::default()
    }
}

fn write_bf16_file(path: &Path, name: &str, values: &[f32], shape: Vec<usize>) -> Result<()> {
    let mut bytes = vec![0u8; values.len() * 2];
    let bits = values.iter().map(|v| (v.to_bits() >> 16) as u16).collect::<Vec<_>>();
    LittleEndian::write_u16_into(&bits, &mut bytes);

    let view = TensorView::new(Dtype::BF16, shape, &bytes)?;
    safetensors::serialize_to_file(vec![(name.to_string(), view)], &None, path)?;
    Ok(())
}

#[test]
fn test_save_then_load_restores_tensors() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut tree = ParameterTree::new();
    tree.insert("transformer.ln_f.kernel", Tensor::new(vec![1.0, -2.5, 3.25], vec![3])?);
    tree.insert("lm_head.kernel", Tensor::new((0..6).map(|v| v as f32 * 0.5).collect(), vec![2, 3])?);

    tree.save_safetensors(&temp_dir.path().join("model.safetensors"))?;
    let loaded = ParameterTree::load_safetensors(temp_dir.path())?;

    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get("lm_head.kernel")?, tree.get("lm_head.kernel")?);
    assert_eq!(loaded.get_shaped("transformer.ln_f.kernel", &[3])?.as_slice(), &[1.0, -2.5, 3.25]);

    Ok(())
}

#[test]
fn test_load_expands_bf16() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_bf16_file(&temp_dir.path().join("a.safetensors"), "w", &[1.0, -0.5, 2.0, 0.0], vec![2, 2])?;

    let loaded = ParameterTree::load_safetensors(temp_dir.path())?;

    assert_eq!(loaded.get("w")?.as_slice(), &[1.0, -0.5, 2.0, 0.0]);
    Ok(())
}

#[test]
fn test_load_rejects_duplicates_and_empty_dirs() -> Result<()> {
    let temp_dir = TempDir::new()?;
    assert!(ParameterTree::load_safetensors(temp_dir.path()).is_err());

    write_bf16_file(&temp_dir.path().join("a.safetensors"), "w", &[1.0], vec![1])?;
    write_bf16_file(&temp_dir.path().join("b.safetensors"), "w", &[2.0], vec![1])?;

    let error = ParameterTree::load_safetensors(temp_dir.path()).unwrap_err();
    assert!(error.to_string().contains("defined twice"));

    Ok(())
}

#[test]
fn test_get_shaped_names_the_parameter() -> Result<()> {
    let mut tree = ParameterTree::new();
    tree.insert("transformer.wte.embedding", Tensor::zeros(&[4, 2]));

    let error = tree.get_shaped("transformer.wte.embedding", &[2, 4]).unwrap_err();
    assert!(error.to_string().contains("transformer.wte.embedding"));
    assert!(tree.get("missing").unwrap_err().to_string().contains("missing"));

    Ok(())
}

#[test]
fn test_init_random_stacks_layers_on_scan_axis() -> Result<()> {
    for axis in [0, 1] {
        let config = ModelConfig { param_scan_axis: axis, ..small_config() };
        let tree = ParameterTree::init_random(&config, 1)?;

        let wq = tree.get(&format!("{SCAN_PREFIX}.attention.wq.kernel"))?;
        let w1 = tree.get(&format!("{SCAN_PREFIX}.feed_forward.w1.kernel"))?;
        match axis {
            0 => {
                assert_eq!(wq.shape(), &[3, 8, 8]);
                assert_eq!(w1.shape(), &[3, 12, 8]);
            }
            _ => {
                assert_eq!(wq.shape(), &[8, 3, 8]);
                assert_eq!(w1.shape(), &[12, 3, 8]);
            }
        }
        assert!(!tree.contains("transformer.h.0.attention.wq.kernel"));
    }

    Ok(())
}

#[test]
fn test_init_random_parameter_values() -> Result<()> {
    let config = ModelConfig { scan_layers: false, tie_word_embeddings: true, ..small_config() };
    let tree = ParameterTree::init_random(&config, 7)?;

    assert!(tree.contains("transformer.h.2.feed_forward.w2.kernel"));
    assert!(!tree.contains("lm_head.kernel"));
    assert!(tree.get("transformer.h.0.ffn_norm.kernel")?.as_slice().iter().all(|&v| v == 1.0));
    assert!(tree.get("transformer.m3.out_proj.bias")?.as_slice().iter().all(|&v| v == 1.0));
    assert!(tree.get("transformer.m1.inp_proj.bias")?.as_slice().iter().all(|&v| v == 0.0));

    let a_log = tree.get_shaped("transformer.m2.s6.a_log", &[16, 4])?;
    assert!((a_log.as_slice()[3] - 4f32.ln()).abs() < 1e-6);

    let wq = tree.get("transformer.h.1.attention.wq.kernel")?.as_slice();
    let std = (wq.iter().map(|v| v * v).sum::<f32>() / wq.len() as f32).sqrt();
    assert!(std > 0.005 && std < 0.05, "std {std}");

    // same seed, same parameters
    let again = ParameterTree::init_random(&config, 7)?;
    assert_eq!(again.get("transformer.wte.embedding")?, tree.get("transformer.wte.embedding")?);

    Ok(())
}

#[test]
fn test_init_random_draws_gaussian_with_configured_std() -> Result<()> {
    let config = ModelConfig { vocab_size: 512, hidden_size: 32, initializer_range: 0.5, ..small_config() };
    let tree = ParameterTree::init_random(&config, 11)?;

    let values = tree.get("transformer.wte.embedding")?.as_slice();
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n).sqrt();
    assert!(mean.abs() < 0.03, "mean {mean}");
    assert!((std - 0.5).abs() < 0.03, "std {std}");

    let within_one_std = values.iter().filter(|v| v.abs() < 0.5).count() as f32 / n;
    assert!((within_one_std - 0.683).abs() < 0.03, "fraction {within_one_std}");

    let negative = ModelConfig { initializer_range: -0.1, ..small_config() };
    assert!(ParameterTree::init_random(&negative, 0).is_err());
    Ok(())
}

#[test]
fn test_parameter_layout_matches_initialized_tree() -> Result<()> {
    for (scan_layers, axis) in [(false, 0), (true, 0), (true, 1)] {
        let config = ModelConfig { scan_layers, param_scan_axis: axis, ..small_config() };
        let tree = ParameterTree::init_random(&config, 3)?;
        let layout = parameter_layout(&config);

        assert_eq!(layout.len(), tree.len());
        for (name, shape) in &layout {
            assert_eq!(tree.get(name)?.shape(), shape.as_slice(), "{name}");
        }
    }
    Ok(())
}
