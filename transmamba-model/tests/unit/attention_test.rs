use super::*;
use crate::mesh::{LocalRing, SingleDevice};
use rand::{Rng, SeedableRng, rngs::StdRng};

const DIMS: AttentionDims = AttentionDims { batch: 2, q_len: 8, kv_len: 8, heads: 2, head_dim: 4 };

fn random(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn qkv(dims: AttentionDims, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let row = dims.heads * dims.head_dim;
    (
        random(dims.batch * dims.q_len * row, &mut rng),
        random(dims.batch * dims.kv_len * row, &mut rng),
        random(dims.batch * dims.kv_len * row, &mut rng),
    )
}

fn assert_close(expected: &[f32], actual: &[f32], tolerance: f32) {
    assert_eq!(expected.len(), actual.len());
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        assert!((e - a).abs() < tolerance, "index {i}: {e} vs {a}");
    }
}

fn meshes() -> Vec<Box<dyn MeshExecution>> {
    vec![
        Box::new(SingleDevice),
        Box::new(LocalRing::new(2).unwrap()),
        Box::new(LocalRing::new(3).unwrap()),
        Box::new(LocalRing::new(4).unwrap()),
    ]
}

#[test]
fn test_ring_attention_matches_standard() -> Result<()> {
    let (q, k, v) = qkv(DIMS, 1);
    let key_mask = vec![1u8; 16];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: None, forget_mask: None };

    let expected = standard_attention(&q, &k, &v, DIMS, &mask, None);

    for mesh in meshes() {
        for chunks in [ChunkSizes { query: 2, key: 2 }, ChunkSizes { query: 3, key: 2 }, ChunkSizes { query: 1, key: 8 }] {
            let actual = ring_attention(&q, &k, &v, DIMS, &mask, chunks, mesh.as_ref(), None)?;
            assert_close(&expected, &actual, 1e-4);
        }
    }

    Ok(())
}

#[test]
fn test_ring_attention_respects_segments_and_padding() -> Result<()> {
    let (q, k, v) = qkv(DIMS, 2);
    // row 1 is left padded by two positions
    let key_mask = [vec![1u8; 8], vec![0, 0, 1, 1, 1, 1, 1, 1]].concat();
    let segments = [vec![0i64, 0, 0, 1, 1, 1, 2, 2], vec![0, 0, 3, 3, 3, 3, 4, 4]].concat();
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: Some((&segments, &segments)), forget_mask: None };

    let expected = standard_attention(&q, &k, &v, DIMS, &mask, None);

    // padded queries see nothing
    assert!(expected[8 * 8..10 * 8].iter().all(|&x| x == 0.0));

    for mesh in meshes() {
        let actual = ring_attention(&q, &k, &v, DIMS, &mask, ChunkSizes { query: 2, key: 2 }, mesh.as_ref(), None)?;
        assert_close(&expected, &actual, 1e-4);
    }

    Ok(())
}

#[test]
fn test_first_segment_token_attends_only_to_itself() {
    let dims = AttentionDims { batch: 1, q_len: 3, kv_len: 3, heads: 1, head_dim: 2 };
    let (q, k, v) = qkv(dims, 3);
    let key_mask = [1u8; 3];
    let segments = [0i64, 1, 1];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: Some((&segments, &segments)), forget_mask: None };

    let output = standard_attention(&q, &k, &v, dims, &mask, None);

    assert_close(&v[0..2], &output[0..2], 1e-6);
    assert_close(&v[2..4], &output[2..4], 1e-6);
}

#[test]
fn test_dropout_drops_same_weights_on_both_paths() -> Result<()> {
    let (q, k, v) = qkv(DIMS, 4);
    let key_mask = vec![1u8; 16];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: None, forget_mask: None };
    let dropout = AttentionDropout { rate: 0.3, stream: DropoutStream::new(99) };

    let expected = standard_attention(&q, &k, &v, DIMS, &mask, Some(dropout));
    let undropped = standard_attention(&q, &k, &v, DIMS, &mask, None);
    assert_ne!(expected, undropped);

    let ring = LocalRing::new(2)?;
    let actual = ring_attention(&q, &k, &v, DIMS, &mask, ChunkSizes { query: 2, key: 2 }, &ring, Some(dropout))?;
    assert_close(&expected, &actual, 1e-4);

    Ok(())
}

#[test]
fn test_decode_offset_matches_prefill_row() -> Result<()> {
    let full = AttentionDims { batch: 1, q_len: 4, kv_len: 4, heads: 2, head_dim: 4 };
    let (q, k, v) = qkv(full, 5);
    let key_mask = [1u8; 4];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: None, forget_mask: None };
    let prefill = standard_attention(&q, &k, &v, full, &mask, None);

    // last query against a cache of 8 slots where 4 are written
    let row = 8;
    let decode = AttentionDims { batch: 1, q_len: 1, kv_len: 8, heads: 2, head_dim: 4 };
    let cached_k = [k.clone(), vec![0.0; 4 * row]].concat();
    let cached_v = [v.clone(), vec![0.0; 4 * row]].concat();
    let cache_mask = [1u8, 1, 1, 1, 0, 0, 0, 0];
    let mask = AttentionMask { query_offset: 3, key_mask: &cache_mask, segments: None, forget_mask: None };

    let step = standard_attention(&q[3 * row..], &cached_k, &cached_v, decode, &mask, None);
    assert_close(&prefill[3 * row..], &step, 1e-5);

    let ring = LocalRing::new(2)?;
    let chunked = ring_attention(&q[3 * row..], &cached_k, &cached_v, decode, &mask, ChunkSizes { query: 1, key: 2 }, &ring, None)?;
    assert_close(&prefill[3 * row..], &chunked, 1e-5);

    Ok(())
}

#[test]
fn test_forgetful_mask_is_per_query() {
    let dims = AttentionDims { batch: 1, q_len: 3, kv_len: 3, heads: 1, head_dim: 2 };
    let (q, k, v) = qkv(dims, 6);
    let key_mask = [1u8; 3];
    // key 0 is hidden from query 2 only, key 2 stays visible to it
    #[rustfmt::skip]
    let keep = [
        true, false, false,
        true, false, false,
        false, false, true,
    ];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: None, forget_mask: Some(&keep) };

    let output = standard_attention(&q, &k, &v, dims, &mask, None);

    assert_close(&v[0..2], &output[0..2], 1e-6);
    assert_close(&v[0..2], &output[2..4], 1e-6);
    assert_close(&v[4..6], &output[4..6], 1e-6);
}

#[test]
fn test_ring_attention_rejects_zero_chunks() {
    let (q, k, v) = qkv(DIMS, 7);
    let key_mask = vec![1u8; 16];
    let mask = AttentionMask { query_offset: 0, key_mask: &key_mask, segments: None, forget_mask: None };

    assert!(ring_attention(&q, &k, &v, DIMS, &mask, ChunkSizes { query: 0, key: 2 }, &SingleDevice, None).is_err());
}
