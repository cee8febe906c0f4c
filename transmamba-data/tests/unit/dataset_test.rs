use super::*;
use crate::example::encode_tokens;
use crate::shard::RawRow;
use std::collections::HashMap;
use std::path::Path;

/// Shards held in memory, keyed by file name.
struct MemoryReader {
    shards: HashMap<PathBuf, Vec<RawRow>>,
}

impl MemoryReader {
    fn new(shards: &[(&str, Vec<(Vec<u32>, i64)>)]) -> Result<Self> {
        let mut map = HashMap::new();
        for (name, rows) in shards {
            let rows = rows
                .iter()
                .map(|(tokens, pred_start)| {
                    Ok(RawRow { dataset: name.to_string(), seq: encode_tokens(tokens)?, pred_start: *pred_start })
                })
                .collect::<Result<Vec<_>>>()?;
            map.insert(PathBuf::from(name), rows);
        }
        Ok(Self { shards: map })
    }
}

impl ShardReader for MemoryReader {
    fn count_rows(&self, path: &Path) -> Result<usize> {
        self.shards.get(path).map(Vec::len).with_context(|| format!("No shard {}", path.display()))
    }

    fn read_row(&self, path: &Path, row: usize) -> Result<RawRow> {
        self.shards
            .get(path)
            .and_then(|rows| rows.get(row))
            .cloned()
            .with_context(|| format!("No row {row} in {}", path.display()))
    }
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

#[test]
fn test_get_maps_global_index_across_shards() -> Result<()> {
    let reader = MemoryReader::new(&[
        ("a", vec![(vec![1, 2], 1), (vec![3, 4], 1), (vec![5, 6], 1)]),
        ("b", vec![(vec![7, 8, 9], 2)]),
    ])?;
    let dataset = RandomAccessDataset::with_reader(paths(&["a", "b"]), reader, 4, 0)?;

    assert_eq!(dataset.len(), 4);
    assert_eq!(dataset.get(2)?.tokens, vec![5, 6, 0, 0, 0]);

    let last = dataset.get(3)?;
    assert_eq!(last.dataset, "b");
    assert_eq!(last.tokens, vec![7, 8, 9, 0, 0]);
    assert_eq!(last.weights, vec![0.0, 1.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn test_failures_name_the_global_index() -> Result<()> {
    let mut reader = MemoryReader::new(&[("a", vec![(vec![1], 1)]), ("b", vec![(vec![2], 1), (vec![3], 1)])])?;
    if let Some(rows) = reader.shards.get_mut(Path::new("b")) {
        rows[1].seq = b"garbage".to_vec();
    }
    let dataset = RandomAccessDataset::with_reader(paths(&["a", "b"]), reader, 4, 0)?;

    let message = format!("{:#}", dataset.get(2).unwrap_err());
    assert!(message.contains("Failed to load example 2"), "{message}");
    assert!(message.contains("decompress"), "{message}");

    assert!(dataset.get(3).is_err());
    assert!(dataset.get(1).is_ok());
    Ok(())
}

#[test]
fn test_overlong_rows_are_errors() -> Result<()> {
    let reader = MemoryReader::new(&[("a", vec![(vec![1, 2, 3, 4, 5, 6], 1)])])?;
    let dataset = RandomAccessDataset::with_reader(paths(&["a"]), reader, 3, 0)?;

    let message = format!("{:#}", dataset.get(0).unwrap_err());
    assert!(message.contains("Failed to load example 0"), "{message}");
    Ok(())
}

#[test]
fn test_unknown_shard_fails_indexing() -> Result<()> {
    let reader = MemoryReader::new(&[("a", vec![])])?;
    assert!(RandomAccessDataset::with_reader(paths(&["a", "missing"]), reader, 3, 0).is_err());
    Ok(())
}

#[test]
fn test_empty_dataset() -> Result<()> {
    let reader = MemoryReader::new(&[("a", vec![])])?;
    let dataset = RandomAccessDataset::with_reader(paths(&["a"]), reader, 3, 0)?;

    assert!(dataset.is_empty());
    assert!(dataset.get(0).is_err());
    Ok(())
}
