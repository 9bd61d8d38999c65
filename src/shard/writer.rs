//! Shard writer
//!
//! Encodes an ordered batch of documents into a new encrypted shard object.
//! The filename is fixed before any encryption happens (random salt hashed
//! with a digest of the batch), so it can serve as associated data for every
//! record and for the header block. Anything moved between shards or
//! modified in place then fails authentication on read.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::format::{encode_header_len, HeaderEntry, ShardHeader};
use crate::crypto::CryptoManager;
use crate::document::{batch_order, Document};
use crate::error::{DbError, DbResult};
use crate::manifest::{ShardFileInfo, SHARD_EXTENSION, SHARD_PREFIX};
use crate::store::{Precondition, StorageBackend};

/// A batch of documents waiting to be materialized as a shard.
#[derive(Debug, Clone)]
pub struct PreparedShard {
    pub documents: Vec<Document>,
    pub level: u8,
}

impl PreparedShard {
    pub fn level0(documents: Vec<Document>) -> Self {
        Self {
            documents,
            level: 0,
        }
    }
}

/// Result of materializing a shard on the store.
#[derive(Debug, Clone)]
pub struct WrittenShard {
    pub info: ShardFileInfo,
    pub header: ShardHeader,
}

/// Derive the content-addressed object name for a batch.
fn shard_filename(salt: &[u8], documents: &[Document]) -> DbResult<String> {
    let mut digest = Sha256::new();
    for doc in documents {
        digest.update(doc.id.as_bytes());
        digest.update(doc.at.to_le_bytes());
        digest.update(doc.seq.to_le_bytes());
        digest.update([doc.del as u8]);
        if let Some(data) = &doc.data {
            digest.update(serde_json::to_vec(data)?);
        }
    }
    let batch_digest = digest.finalize();

    let mut outer = Sha256::new();
    outer.update(salt);
    outer.update(batch_digest);
    let name = base32::encode(
        base32::Alphabet::RFC4648 { padding: false },
        &outer.finalize(),
    )
    .to_lowercase();
    Ok(format!("{}{}{}", SHARD_PREFIX, name, SHARD_EXTENSION))
}

/// Write one shard. Documents are sorted into the canonical (`at`, `id`)
/// order; duplicated ids within one batch are rejected.
pub async fn write_shard(
    store: &dyn StorageBackend,
    crypto: &CryptoManager,
    shard: PreparedShard,
) -> DbResult<WrittenShard> {
    let mut documents = shard.documents;
    if documents.is_empty() {
        return Err(DbError::InvariantViolation(
            "refusing to write an empty shard".to_string(),
        ));
    }
    documents.sort_by(batch_order);
    for pair in documents.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(DbError::InvariantViolation(format!(
                "duplicate id '{}' in one shard batch",
                pair[0].id
            )));
        }
    }

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let filename = shard_filename(&salt, &documents)?;
    let aad = filename.as_bytes();

    let mut body: Vec<u8> = Vec::new();
    let mut entries = Vec::with_capacity(documents.len());
    for doc in &documents {
        let (offset, len) = match &doc.data {
            Some(data) if !doc.del => {
                let record = crypto.encrypt(&serde_json::to_vec(data)?, aad)?;
                let offset = u32::try_from(body.len()).map_err(|_| {
                    DbError::EncodingError("shard body exceeds u32 offsets".to_string())
                })?;
                let len = u32::try_from(record.len()).map_err(|_| {
                    DbError::EncodingError("record exceeds u32 length".to_string())
                })?;
                body.extend_from_slice(&record);
                (offset, len)
            }
            _ => (0, 0),
        };
        entries.push(HeaderEntry {
            id: doc.id.clone(),
            at: doc.at,
            seq: doc.seq,
            del: doc.del,
            offset,
            len,
        });
    }

    let header = ShardHeader::new(entries);
    let range = header.at_range()?;
    let encrypted_header = crypto.encrypt(&header.encode()?, aad)?;

    let mut file = body;
    file.extend_from_slice(&encrypted_header);
    file.extend_from_slice(&encode_header_len(encrypted_header.len())?);

    store.put(&filename, &file, Precondition::NotExists).await?;
    debug!(
        filename = %filename,
        level = shard.level,
        documents = header.entries.len(),
        bytes = file.len(),
        "materialized shard"
    );

    Ok(WrittenShard {
        info: ShardFileInfo {
            filename,
            level: shard.level,
            range,
        },
        header,
    })
}
