//! Key derivation
//!
//! Two derivation paths feed the engine:
//! - PBKDF2-HMAC-SHA-256 turns a password or quick-unlock PIN into a
//!   key-wrapping key. The iteration count is deliberately high; unlocking
//!   is a rare, user-initiated operation.
//! - HKDF-SHA-256 expands the master key into per-purpose subkeys so shard
//!   encryption, manifest signing, and device wrapping never share a key.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DbError, DbResult};

/// Contractual PBKDF2 iteration count for password and PIN derivation.
pub const PBKDF2_ITERATIONS: u32 = 1_500_000;

/// All keys in the system are 256 bits.
pub const KEY_SIZE: usize = 32;

/// Salt length for PBKDF2 derivations.
pub const SALT_SIZE: usize = 16;

/// 256-bit key material, zeroized on drop and redacted in Debug output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(DbError::InvariantViolation(format!(
                "expected {}-byte key, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut buf = [0u8; KEY_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Fresh random key from the OS generator.
    pub fn random() -> Self {
        let mut buf = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut buf);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Purpose strings for HKDF subkey expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyPurpose {
    /// Shard body and header encryption
    Shard,
    /// Manifest HMAC signature
    Sign,
    /// Device-registry wrapping operations
    Device,
}

impl SubkeyPurpose {
    fn info(self) -> &'static [u8] {
        match self {
            SubkeyPurpose::Shard => b"shard",
            SubkeyPurpose::Sign => b"sign",
            SubkeyPurpose::Device => b"device",
        }
    }
}

/// Generate a random PBKDF2 salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a key-wrapping key from a password or PIN.
pub fn derive_wrapping_key(secret: &[u8], salt: &[u8], iterations: u32) -> KeyMaterial {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut out);
    KeyMaterial::from_bytes(out)
}

/// Expand a per-purpose subkey from the master key.
pub fn derive_subkey(master: &KeyMaterial, purpose: SubkeyPurpose) -> DbResult<KeyMaterial> {
    let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(purpose.info(), &mut out)
        .map_err(|e| DbError::InternalError(format!("HKDF expand failed: {}", e)))?;
    Ok(KeyMaterial::from_bytes(out))
}
