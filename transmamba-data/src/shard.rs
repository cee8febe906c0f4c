#[cfg(test)]
#[path = "../tests/unit/shard_test.rs"]
mod shard_test;

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};

/// One undecoded row of a shard table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub dataset: String,
    /// zstd-compressed ASCII token ids.
    pub seq: Vec<u8>,
    pub pred_start: i64,
}

/// Read access to row-oriented shard files.
///
/// Implementations must allow concurrent reads from several threads.
pub trait ShardReader: Send + Sync {
    fn count_rows(&self, path: &Path) -> Result<usize>;

    /// Reads the row with zero-based id `row`.
    fn read_row(&self, path: &Path, row: usize) -> Result<RawRow>;
}

/// Reads shards stored as SQLite files with a
/// `rows(id INTEGER, dataset TEXT, seq BLOB, pred_start INTEGER)` table.
///
/// Every call opens its own read-only connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteShardReader;

impl SqliteShardReader {
    fn open(path: &Path) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(path, flags).with_context(|| format!("Failed to open shard {}", path.display()))
    }
}

impl ShardReader for SqliteShardReader {
    fn count_rows(&self, path: &Path) -> Result<usize> {
        let connection = Self::open(path)?;
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM rows", [], |row| row.get(0))
            .with_context(|| format!("Failed to count rows of {}", path.display()))?;

        usize::try_from(count).with_context(|| format!("Invalid row count {count} in {}", path.display()))
    }

    fn read_row(&self, path: &Path, row: usize) -> Result<RawRow> {
        let connection = Self::open(path)?;
        let id = i64::try_from(row)?;

        connection
            .query_row("SELECT dataset, seq, pred_start FROM rows WHERE id == ?1", [id], |r| {
                Ok(RawRow { dataset: r.get(0)?, seq: r.get(1)?, pred_start: r.get(2)? })
            })
            .optional()
            .with_context(|| format!("Failed to read row {row} of {}", path.display()))?
            .with_context(|| format!("Row {row} does not exist in {}", path.display()))
    }
}
