//! Random-access training data over read-only SQLite shards.
//!
//! Each shard holds a `rows(id, dataset, seq, pred_start)` table whose `seq`
//! column is a zstd-compressed string of whitespace separated token ids.
//! A [`RandomAccessDataset`] concatenates shards behind one flat index and
//! [`BatchLoader`] collates its examples into next-token batches.

pub mod dataset;
pub mod example;
pub mod index;
pub mod loader;
pub mod shard;

pub use crate::dataset::RandomAccessDataset;
pub use crate::example::{Example, build_example, decode_tokens, encode_tokens};
pub use crate::index::{RowLocation, ShardIndex};
pub use crate::loader::{Batch, BatchLoader, DataModule, collate, discover_shards};
pub use crate::shard::{RawRow, ShardReader, SqliteShardReader};
