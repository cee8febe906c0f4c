use super::*;
use crate::tensor::Tensor;

fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    (0..len).map(|i| (((i as u32).wrapping_mul(2654435761) ^ seed) % 1000) as f32 / 500.0 - 1.0).collect()
}

fn linear(in_features: usize, out_features: usize, seed: u32) -> Linear {
    Linear::new(pseudo_random(in_features * out_features, seed), None, in_features, out_features)
}

#[test]
fn test_rms_norm_is_scale_invariant() {
    let norm = RMSNorm::new(vec![1.0, 0.5, 2.0, 1.5], 1e-6);
    let x = vec![0.3, -1.2, 2.0, 0.7];

    let base = norm.forward_rows(&x);
    for c in [0.01f32, 3.0, 250.0] {
        let scaled = norm.forward_rows(&x.iter().map(|v| v * c).collect::<Vec<_>>());
        for (a, b) in base.iter().zip(&scaled) {
            assert!((a - b).abs() < 1e-4, "scale {c}: {a} vs {b}");
        }
    }
}

#[test]
fn test_rms_norm_unit_rms_input_returns_scale() {
    let weight = vec![0.5, 2.0, 1.0, 3.0];
    let norm = RMSNorm::new(weight.clone(), 1e-6);

    // mean(x^2) == 1
    let output = norm.forward_rows(&[1.0, -1.0, 1.0, -1.0]);

    for ((o, w), sign) in output.iter().zip(&weight).zip([1.0, -1.0, 1.0, -1.0]) {
        assert!((o - sign * w).abs() < 1e-5);
    }
}

#[test]
fn test_rms_norm_reads_named_parameter() -> anyhow::Result<()> {
    let mut params = ParameterTree::new();
    params.insert("ffn_norm.kernel", Tensor::filled(&[3], 2.0));

    let norm = RMSNorm::from_params(&params, "ffn_norm.kernel", 3, 1e-6)?;
    assert_eq!(norm.dim(), 3);
    assert!(RMSNorm::from_params(&params, "ffn_norm.kernel", 4, 1e-6).is_err());

    Ok(())
}

#[test]
fn test_linear_applies_bias() -> anyhow::Result<()> {
    let mut params = ParameterTree::new();
    params.insert("proj.kernel", Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2])?);
    params.insert("proj.bias", Tensor::new(vec![0.5, -0.5, 0.0], vec![3])?);

    let proj = Linear::from_params(&params, "proj", 2, 3, true)?;

    assert_eq!(proj.forward(&[2.0, 3.0, -1.0, 1.0]), vec![2.5, 2.5, 5.0, -0.5, 0.5, 0.0]);
    Ok(())
}

#[test]
fn test_token_embedding_rejects_out_of_vocab() {
    let embedding = TokenEmbedding::new((0..6).map(|v| v as f32).collect(), 2);

    assert_eq!(embedding.forward(&[2, 0]).unwrap(), vec![4.0, 5.0, 0.0, 1.0]);
    assert!(embedding.forward(&[3]).is_err());
}

#[test]
fn test_blockwise_feed_forward_matches_unchunked() {
    let (dim, hidden, batch, seq_len) = (6, 10, 2, 11);
    let input = pseudo_random(batch * seq_len * dim, 17);

    let build = |chunk_len| FeedForward::new(linear(dim, hidden, 1), linear(hidden, dim, 2), linear(dim, hidden, 3), 0.0, chunk_len);

    let full = build(None).forward(&input, seq_len, None);
    for chunk in [1, 3, 4, 11, 32] {
        let chunked = build(Some(chunk)).forward(&input, seq_len, None);
        assert_eq!(chunked.len(), full.len());
        for (a, b) in full.iter().zip(&chunked) {
            assert!((a - b).abs() < 1e-6, "chunk {chunk}");
        }
    }
}

#[test]
fn test_blockwise_feed_forward_triggers_on_sequence_length() {
    let ff = FeedForward::new(linear(4, 8, 1), linear(8, 4, 2), linear(4, 8, 3), 0.0, Some(4));

    // many short sequences stay on the single-block path
    assert!(!ff.is_blockwise(3));
    assert!(ff.is_blockwise(4));
    assert!(ff.is_blockwise(9));

    let unchunked = FeedForward::new(linear(4, 8, 1), linear(8, 4, 2), linear(4, 8, 3), 0.0, None);
    assert!(!unchunked.is_blockwise(1024));
}

#[test]
fn test_feed_forward_dropout_only_with_stream() {
    let (dim, hidden) = (4, 8);
    let input = pseudo_random(5 * dim, 3);
    let ff = FeedForward::new(linear(dim, hidden, 4), linear(hidden, dim, 5), linear(dim, hidden, 6), 0.5, None);

    let deterministic = ff.forward(&input, 5, None);
    let dropped = ff.forward(&input, 5, Some(DropoutStream::new(1)));

    assert_eq!(ff.forward(&input, 5, None), deterministic);
    assert!(dropped.iter().zip(&deterministic).all(|(&d, &k)| d == 0.0 || (d - 2.0 * k).abs() < 1e-5));
    assert!(dropped.iter().any(|&d| d == 0.0));
}
