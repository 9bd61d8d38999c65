//! Binary shard layout
//!
//! ```text
//! [encrypted body: one AEAD blob per live document ...]
//! [header block (encrypted)                            ]
//! [header length: uint32 little-endian                 ]
//! ```
//!
//! The header is written last because its entries reference body offsets;
//! keeping its length in the final 4 bytes lets a reader open a shard with
//! a single tail read and no auxiliary index. Tombstones carry no body
//! record and are represented by zero-length entries.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{DbError, DbResult};
use crate::manifest::AtRange;

/// Shard format version.
pub const SHARD_VERSION: u8 = 1;

/// Size of the trailing header-length field.
pub const SHARD_HEADER_LENGTH_BYTES: usize = 4;

/// One document's index entry in the shard header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderEntry {
    pub id: String,
    pub at: u64,
    pub seq: u64,
    pub del: bool,
    /// Byte offset of the encrypted record within the body
    pub offset: u32,
    /// Byte length of the encrypted record, 0 for tombstones
    pub len: u32,
}

impl HeaderEntry {
    /// Rebuild the indexed part of a document; the payload, if any, comes
    /// from the body.
    pub fn to_document(&self, data: Option<serde_json::Value>) -> Document {
        Document {
            id: self.id.clone(),
            at: self.at,
            seq: self.seq,
            del: self.del,
            data,
        }
    }
}

/// The in-file index of a shard's documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u8,
    pub entries: Vec<HeaderEntry>,
}

impl ShardHeader {
    pub fn new(entries: Vec<HeaderEntry>) -> Self {
        Self {
            version: SHARD_VERSION,
            entries,
        }
    }

    pub fn encode(&self) -> DbResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| DbError::EncodingError(format!("header serialization failed: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        let header: ShardHeader = bincode::deserialize(bytes).map_err(|e| {
            DbError::CorruptedOrTampered(format!("header deserialization failed: {}", e))
        })?;
        if header.version != SHARD_VERSION {
            return Err(DbError::InvariantViolation(format!(
                "unsupported shard version {}",
                header.version
            )));
        }
        header.validate()?;
        Ok(header)
    }

    /// Check the structural invariants: entries ordered by (`at`, `id`),
    /// body regions non-overlapping, tombstones bodiless.
    pub fn validate(&self) -> DbResult<()> {
        for pair in self.entries.windows(2) {
            let ordered = (pair[0].at, pair[0].id.as_str()) <= (pair[1].at, pair[1].id.as_str());
            if !ordered {
                return Err(DbError::InvariantViolation(
                    "shard header entries out of order".to_string(),
                ));
            }
        }
        let mut regions: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.len > 0)
            .map(|e| (e.offset, e.len))
            .collect();
        regions.sort_unstable();
        for pair in regions.windows(2) {
            let end = pair[0]
                .0
                .checked_add(pair[0].1)
                .ok_or_else(|| DbError::InvariantViolation("body offset overflow".to_string()))?;
            if end > pair[1].0 {
                return Err(DbError::InvariantViolation(
                    "shard body regions overlap".to_string(),
                ));
            }
        }
        for entry in &self.entries {
            if entry.del && entry.len != 0 {
                return Err(DbError::InvariantViolation(format!(
                    "tombstone '{}' carries a body record",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Range over the `at` timestamps of the indexed documents.
    pub fn at_range(&self) -> DbResult<AtRange> {
        let min = self.entries.first().map(|e| e.at);
        let max = self.entries.last().map(|e| e.at);
        match (min, max) {
            (Some(min), Some(max)) => Ok(AtRange::new(min, max)),
            _ => Err(DbError::InvariantViolation("empty shard header".to_string())),
        }
    }

    pub fn entry_for(&self, id: &str) -> Option<&HeaderEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.iter().filter(|e| e.del).count()
    }
}

/// Encode the trailing header-length field.
pub fn encode_header_len(len: usize) -> DbResult<[u8; SHARD_HEADER_LENGTH_BYTES]> {
    let len = u32::try_from(len)
        .map_err(|_| DbError::EncodingError("shard header exceeds u32 length".to_string()))?;
    Ok(len.to_le_bytes())
}

/// Decode the trailing header-length field.
pub fn decode_header_len(bytes: &[u8]) -> DbResult<u32> {
    let bytes: [u8; SHARD_HEADER_LENGTH_BYTES] = bytes.try_into().map_err(|_| {
        DbError::CorruptedOrTampered("truncated shard header length".to_string())
    })?;
    Ok(u32::from_le_bytes(bytes))
}
