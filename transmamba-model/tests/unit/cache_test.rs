use super::*;
use crate::mesh::{LocalRing, SingleDevice};
use anyhow::Result;

/// `[batch, len, heads * head_dim]` rows where every feature equals `base + position`.
fn rows(batch: usize, len: usize, row: usize, base: f32) -> Vec<f32> {
    (0..batch).flat_map(|b| (0..len).flat_map(move |t| vec![base + (b * 100 + t) as f32; row])).collect()
}

#[test]
fn test_write_advances_index() -> Result<()> {
    let mut cache = LayerCache::new(1, 8, 2, 2, &SingleDevice)?;
    assert_eq!(cache.index(), 0);

    assert_eq!(cache.write(&rows(1, 3, 4, 0.0), &rows(1, 3, 4, 0.5), &[1, 1, 1], 3)?, 0);
    assert_eq!(cache.index(), 3);
    assert_eq!(cache.write(&rows(1, 1, 4, 10.0), &rows(1, 1, 4, 10.5), &[1], 1)?, 3);
    assert_eq!(cache.index(), 4);

    let keys = cache.keys();
    assert_eq!(&keys[3 * 4..4 * 4], &[10.0; 4]);
    assert_eq!(&keys[4 * 4..], &[0.0; 16]);
    assert_eq!(cache.key_mask(), vec![1, 1, 1, 1, 0, 0, 0, 0]);

    Ok(())
}

#[test]
fn test_write_past_max_length_fails() -> Result<()> {
    let mut cache = LayerCache::new(1, 4, 1, 2, &SingleDevice)?;
    cache.write(&rows(1, 3, 2, 0.0), &rows(1, 3, 2, 0.0), &[1; 3], 3)?;

    let error = cache.write(&rows(1, 2, 2, 0.0), &rows(1, 2, 2, 0.0), &[1; 2], 2).unwrap_err();

    assert!(error.to_string().starts_with("KV cache overflow"));
    assert_eq!(cache.index(), 3);
    Ok(())
}

#[test]
fn test_each_position_lands_in_one_shard() -> Result<()> {
    let ring = LocalRing::new(2)?;
    let mut cache = LayerCache::new(2, 4, 1, 1, &ring)?;
    assert_eq!(cache.shard_ranges(), vec![0..2, 2..4]);

    cache.write(&rows(2, 3, 1, 1.0), &rows(2, 3, 1, 1.0), &[1, 1, 1, 0, 1, 1], 3)?;

    assert_eq!(cache.shards[0].keys, vec![1.0, 2.0, 101.0, 102.0]);
    assert_eq!(cache.shards[1].keys, vec![3.0, 0.0, 103.0, 0.0]);
    assert_eq!(cache.shards[1].key_mask, vec![1, 0, 1, 0]);

    // gathered view is shard-agnostic
    assert_eq!(cache.keys(), vec![1.0, 2.0, 3.0, 0.0, 101.0, 102.0, 103.0, 0.0]);
    assert_eq!(cache.key_mask(), vec![1, 1, 1, 0, 0, 1, 1, 0]);

    Ok(())
}

#[test]
fn test_shard_boundary_decode_steps() -> Result<()> {
    let ring = LocalRing::new(4)?;
    let mut cache = LayerCache::new(1, 8, 1, 1, &ring)?;

    for step in 0..8 {
        cache.write(&[step as f32], &[step as f32], &[1], 1)?;
    }

    assert_eq!(cache.values(), (0..8).map(|v| v as f32).collect::<Vec<_>>());
    assert!(cache.write(&[0.0], &[0.0], &[1], 1).is_err());
    Ok(())
}

#[test]
fn test_rejects_mismatched_shapes() -> Result<()> {
    let mut cache = LayerCache::new(2, 4, 1, 2, &SingleDevice)?;

    // batch of one against a batch-two cache
    assert!(cache.write(&rows(1, 1, 2, 0.0), &rows(1, 1, 2, 0.0), &[1], 1).is_err());
    assert_eq!(cache.index(), 0);

    assert!(LayerCache::new(1, 6, 1, 1, &LocalRing::new(4)?).is_err());
    assert!(LayerCache::new(1, 0, 1, 1, &SingleDevice).is_err());

    Ok(())
}

#[test]
fn test_model_cache_has_one_layer_per_block() -> Result<()> {
    let config = ModelConfig { hidden_size: 8, num_attention_heads: 2, num_hidden_layers: 3, ..ModelConfig::default() };
    let cache = ModelCache::new(&config, 2, 6, &ExecutionContext::single_device())?;

    assert_eq!(cache.layers.len(), 3);
    assert_eq!((cache.index(), cache.batch(), cache.max_length()), (0, 2, 6));

    assert!(ModelCache::new(&config, 1, 6, &ExecutionContext::local_ring(4)?).is_err());
    Ok(())
}
