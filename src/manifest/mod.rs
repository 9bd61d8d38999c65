//! Manifest model
//!
//! The manifest is the single root record of a database: a signed,
//! monotonically versioned object naming every shard file and carrying the
//! device-key registry. Exactly one manifest is current; every mutation goes
//! through the compare-and-swap loop in [`manager`].

pub mod manager;

pub use manager::{ManifestManager, ManifestUpdate, UpdateOutcome};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Manifest schema version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Fixed object name of the manifest.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Prefix under which shard objects live.
pub const SHARD_PREFIX: &str = "shards/";

/// Extension of shard objects.
pub const SHARD_EXTENSION: &str = ".clx";

/// Prefix reserved for the large-blob subsystem.
pub const BLOB_PREFIX: &str = "blobs/";

/// Manifest signature length in bytes (HMAC-SHA-256).
pub const SIGNATURE_SIZE: usize = 32;

/// Closed range over the `at` timestamps of a shard's documents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AtRange {
    pub min: u64,
    pub max: u64,
}

impl AtRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn overlaps(&self, other: &AtRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    pub fn merge(&self, other: &AtRange) -> AtRange {
        AtRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Descriptor of one shard file as recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShardFileInfo {
    pub filename: String,
    pub level: u8,
    pub range: AtRange,
}

/// Per-device unlock credential. The registry stores only wrapped values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyEntry {
    /// Master key wrapped under the device's PIN-derived key,
    /// `hex(salt ‖ nonce ‖ ciphertext ‖ tag)`
    pub key: String,
    pub device_name: String,
    pub last_used_at: u64,
}

/// Crypto envelope of an encrypted database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CryptoBlock {
    /// Random value refreshed on every finalize, so two manifests with the
    /// same content never share signing bytes
    pub nonce: String,
    pub timestamp: u64,
    /// Master key wrapped under the password-derived key,
    /// `hex(nonce ‖ ciphertext ‖ tag)`
    pub master_key: String,
    /// Hex PBKDF2 salt for the master password
    pub master_key_salt: String,
    /// Registry: device id → wrapped credential
    pub device_key: BTreeMap<String, DeviceKeyEntry>,
    /// Hex HMAC-SHA-256 over the canonical manifest bytes
    pub signature: String,
}

/// The root record of a database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub uuid: String,
    pub last_sequence: u64,
    pub shard_files: Vec<ShardFileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoBlock>,
}

impl Manifest {
    /// Seed an empty manifest with a fresh database identity.
    pub fn empty() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            uuid: Uuid::new_v4().to_string(),
            last_sequence: 0,
            shard_files: Vec::new(),
            crypto: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn has_shard(&self, filename: &str) -> bool {
        self.shard_files.iter().any(|s| s.filename == filename)
    }

    pub fn shards_at_level(&self, level: u8) -> Vec<&ShardFileInfo> {
        self.shard_files.iter().filter(|s| s.level == level).collect()
    }

    pub fn encode(&self) -> DbResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.version > PROTOCOL_VERSION {
            return Err(DbError::InvariantViolation(format!(
                "manifest version {} is newer than supported {}",
                manifest.version, PROTOCOL_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Canonical byte representation used for signing: JSON with keys in
    /// lexicographic order and the signature field replaced by zero bytes of
    /// the signature length.
    pub fn canonical_signing_bytes(&self) -> DbResult<Vec<u8>> {
        let mut unsigned = self.clone();
        if let Some(crypto) = unsigned.crypto.as_mut() {
            crypto.signature = hex::encode([0u8; SIGNATURE_SIZE]);
        }
        // serde_json maps are BTreeMap-backed by default, so a Value
        // round-trip yields lexicographic key order regardless of struct
        // field declaration order.
        let value = serde_json::to_value(&unsigned)?;
        Ok(serde_json::to_vec(&value)?)
    }
}
