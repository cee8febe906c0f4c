use super::*;
use rusqlite::params;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_shard(dir: &TempDir, name: &str, rows: &[(&str, &[u8], i64)]) -> Result<PathBuf> {
    let path = dir.path().join(name);
    let connection = Connection::open(&path)?;
    connection.execute("CREATE TABLE rows (id INTEGER PRIMARY KEY, dataset TEXT, seq BLOB, pred_start INTEGER)", [])?;
    for (id, (dataset, seq, pred_start)) in rows.iter().enumerate() {
        connection.execute(
            "INSERT INTO rows (id, dataset, seq, pred_start) VALUES (?1, ?2, ?3, ?4)",
            params![id as i64, dataset, seq, pred_start],
        )?;
    }
    Ok(path)
}

#[test]
fn test_count_and_read_rows() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write_shard(&dir, "a.db", &[("books", b"\x01\x02", 3), ("code", b"", 1)])?;

    let reader = SqliteShardReader;
    assert_eq!(reader.count_rows(&path)?, 2);

    let row = reader.read_row(&path, 1)?;
    assert_eq!(row, RawRow { dataset: "code".to_string(), seq: vec![], pred_start: 1 });
    assert_eq!(reader.read_row(&path, 0)?.seq, vec![1, 2]);
    Ok(())
}

#[test]
fn test_missing_row_names_id_and_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write_shard(&dir, "b.db", &[("books", b"x", 1)])?;

    let err = SqliteShardReader.read_row(&path, 7).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Row 7"), "{message}");
    assert!(message.contains("b.db"), "{message}");
    Ok(())
}

#[test]
fn test_missing_file_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("absent.db");

    assert!(SqliteShardReader.count_rows(&path).is_err());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn test_table_without_rows_schema_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("other.db");
    Connection::open(&path)?.execute("CREATE TABLE other (x INTEGER)", [])?;

    let message = format!("{:#}", SqliteShardReader.count_rows(&path).unwrap_err());
    assert!(message.contains("Failed to count rows"), "{message}");
    Ok(())
}
