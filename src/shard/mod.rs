//! Encrypted document shards
//!
//! A shard is an immutable, encrypted batch of document records produced by
//! one sync. This module holds the binary format, the writer, the
//! random-access reader, and the per-database header cache.

pub mod cache;
pub mod format;
pub mod reader;
pub mod writer;

pub use cache::{CachedHeader, HeaderCache};
pub use format::{HeaderEntry, ShardHeader, SHARD_HEADER_LENGTH_BYTES, SHARD_VERSION};
pub use reader::ShardReader;
pub use writer::{write_shard, PreparedShard, WrittenShard};
