//! AEAD record envelope
//!
//! Every encrypted blob in the system (shard records, shard headers, wrapped
//! keys) uses AES-256-GCM with a fresh 96-bit random nonce and the 128-bit
//! authentication tag appended to the ciphertext. The stored form is
//! `nonce ‖ ciphertext ‖ tag`. Associated data binds a blob to its context,
//! the shard filename for shard contents.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::kdf::KeyMaterial;
use crate::error::{DbError, DbResult};

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, binding `aad`.
pub fn encrypt(key: &KeyMaterial, plaintext: &[u8], aad: &[u8]) -> DbResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| DbError::InternalError(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| DbError::InternalError("AES-GCM encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce ‖ ciphertext ‖ tag` blob. Any authentication failure is
/// reported as `CorruptedOrTampered`, never retried.
pub fn decrypt(key: &KeyMaterial, blob: &[u8], aad: &[u8]) -> DbResult<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(DbError::CorruptedOrTampered(format!(
            "ciphertext too short: {} bytes",
            blob.len()
        )));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| DbError::InternalError(format!("cipher init failed: {}", e)))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            DbError::CorruptedOrTampered("AEAD authentication failed".to_string())
        })
}

/// Size of the envelope around a plaintext of `len` bytes.
pub fn sealed_len(len: usize) -> usize {
    NONCE_SIZE + len + TAG_SIZE
}
