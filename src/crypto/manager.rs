//! Crypto manager
//!
//! Owns the master key and its derived subkeys for one client. The master
//! key never leaves this module unwrapped: the manifest carries it wrapped
//! under the password-derived key and, per registered device, under a
//! PIN-derived key. All key material is dropped (and zeroized) on lock.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use super::cipher::{decrypt, encrypt};
use super::kdf::{
    derive_subkey, derive_wrapping_key, random_salt, KeyMaterial, SubkeyPurpose, SALT_SIZE,
};
use crate::document::now_millis;
use crate::error::{DbError, DbResult};
use crate::manifest::{CryptoBlock, DeviceKeyEntry, Manifest, SIGNATURE_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// `last_used_at` refresh is skipped when the entry was touched within this
/// window, to keep unlock storms from contending on the manifest.
pub const TOUCH_SKIP_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Stable identity of the local device.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
}

struct KeySet {
    master: KeyMaterial,
    shard: KeyMaterial,
    sign: KeyMaterial,
    // Held for parity with the other subkeys; reserved for device-local
    // encrypted caches.
    #[allow(dead_code)]
    device: KeyMaterial,
}

impl KeySet {
    fn load(master: KeyMaterial) -> DbResult<Self> {
        let shard = derive_subkey(&master, SubkeyPurpose::Shard)?;
        let sign = derive_subkey(&master, SubkeyPurpose::Sign)?;
        let device = derive_subkey(&master, SubkeyPurpose::Device)?;
        Ok(Self {
            master,
            shard,
            sign,
            device,
        })
    }
}

enum KeyState {
    /// Unencrypted database: encrypt/decrypt are identity, signing is a
    /// no-op, verification accepts anything.
    Plaintext,
    Locked,
    Unlocked(KeySet),
}

pub struct CryptoManager {
    identity: DeviceIdentity,
    iterations: u32,
    state: RwLock<KeyState>,
}

impl CryptoManager {
    /// Manager for an unencrypted database.
    pub fn plaintext(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            iterations: 1,
            state: RwLock::new(KeyState::Plaintext),
        }
    }

    /// Manager for an encrypted database, starting locked.
    pub fn locked(identity: DeviceIdentity, iterations: u32) -> Self {
        Self {
            identity,
            iterations,
            state: RwLock::new(KeyState::Locked),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(*self.state.read(), KeyState::Plaintext)
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(*self.state.read(), KeyState::Plaintext | KeyState::Unlocked(_))
    }

    /// Drop all key material. Subsequent operations on an encrypted
    /// database fail until the next unlock.
    pub fn lock(&self) {
        let mut state = self.state.write();
        if !matches!(*state, KeyState::Plaintext) {
            *state = KeyState::Locked;
        }
    }

    async fn derive_kwk(&self, secret: Vec<u8>, salt: Vec<u8>) -> DbResult<KeyMaterial> {
        let iterations = self.iterations;
        tokio::task::spawn_blocking(move || derive_wrapping_key(&secret, &salt, iterations))
            .await
            .map_err(|e| DbError::InternalError(format!("KDF task failed: {}", e)))
    }

    /// Create the crypto envelope for a brand-new encrypted database:
    /// generate a master key, wrap it under the password, and load subkeys.
    pub async fn initialize_crypto(&self, password: &str) -> DbResult<CryptoBlock> {
        let master = KeyMaterial::random();
        let salt = random_salt();
        let kwk = self
            .derive_kwk(password.as_bytes().to_vec(), salt.to_vec())
            .await?;
        let wrapped = encrypt(&kwk, master.as_bytes(), b"master-key")?;

        let block = CryptoBlock {
            nonce: random_hex(16),
            timestamp: now_millis(),
            master_key: hex::encode(wrapped),
            master_key_salt: hex::encode(salt),
            device_key: BTreeMap::new(),
            signature: hex::encode([0u8; SIGNATURE_SIZE]),
        };

        *self.state.write() = KeyState::Unlocked(KeySet::load(master)?);
        debug!("initialized crypto envelope for new database");
        Ok(block)
    }

    async fn unwrap_master(&self, block: &CryptoBlock, password: &str) -> DbResult<KeyMaterial> {
        let salt = decode_hex(&block.master_key_salt, "masterKeySalt")?;
        let wrapped = decode_hex(&block.master_key, "masterKey")?;
        let kwk = self
            .derive_kwk(password.as_bytes().to_vec(), salt)
            .await?;
        let master = decrypt(&kwk, &wrapped, b"master-key")
            .map_err(|_| DbError::AuthFailure("wrong master password".to_string()))?;
        KeyMaterial::from_slice(&master)
    }

    /// Unlock with the master password and load subkeys in memory.
    pub async fn unlock_with_master(&self, block: &CryptoBlock, password: &str) -> DbResult<()> {
        let master = self.unwrap_master(block, password).await?;
        *self.state.write() = KeyState::Unlocked(KeySet::load(master)?);
        Ok(())
    }

    /// Unlock with a registered device's quick-unlock PIN.
    pub async fn unlock_with_device(
        &self,
        block: &CryptoBlock,
        device_id: &str,
        pin: &str,
    ) -> DbResult<()> {
        let entry = block.device_key.get(device_id).ok_or_else(|| {
            DbError::AuthFailure(format!("device '{}' is not registered", device_id))
        })?;
        let blob = decode_hex(&entry.key, "deviceKey")?;
        if blob.len() <= SALT_SIZE {
            return Err(DbError::CorruptedOrTampered(
                "wrapped device key too short".to_string(),
            ));
        }
        let (salt, wrapped) = blob.split_at(SALT_SIZE);
        let kwk = self
            .derive_kwk(pin.as_bytes().to_vec(), salt.to_vec())
            .await?;
        let master = decrypt(&kwk, wrapped, device_id.as_bytes())
            .map_err(|_| DbError::AuthFailure("wrong device PIN".to_string()))?;
        let master = KeyMaterial::from_slice(&master)?;
        *self.state.write() = KeyState::Unlocked(KeySet::load(master)?);
        Ok(())
    }

    fn with_keys<T>(&self, f: impl FnOnce(&KeySet) -> DbResult<T>) -> DbResult<T> {
        match &*self.state.read() {
            KeyState::Unlocked(keys) => f(keys),
            KeyState::Locked => Err(DbError::AuthFailure(
                "database is locked, unlock first".to_string(),
            )),
            KeyState::Plaintext => Err(DbError::InvariantViolation(
                "crypto operation on an unencrypted database".to_string(),
            )),
        }
    }

    /// Encrypt shard bytes. Identity for unencrypted databases.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> DbResult<Vec<u8>> {
        if self.is_plaintext() {
            return Ok(plaintext.to_vec());
        }
        self.with_keys(|keys| encrypt(&keys.shard, plaintext, aad))
    }

    /// Decrypt shard bytes. Identity for unencrypted databases.
    pub fn decrypt(&self, blob: &[u8], aad: &[u8]) -> DbResult<Vec<u8>> {
        if self.is_plaintext() {
            return Ok(blob.to_vec());
        }
        self.with_keys(|keys| decrypt(&keys.shard, blob, aad))
    }

    fn sign_bytes(&self, keys: &KeySet, manifest: &Manifest) -> DbResult<Vec<u8>> {
        let canonical = manifest.canonical_signing_bytes()?;
        let mut mac = HmacSha256::new_from_slice(keys.sign.as_bytes())
            .map_err(|e| DbError::InternalError(format!("HMAC init failed: {}", e)))?;
        mac.update(&canonical);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Recompute the signature of a manifest about to be committed. The
    /// crypto nonce and timestamp are refreshed as part of finalization.
    pub fn finalize_manifest(&self, mut manifest: Manifest) -> DbResult<Manifest> {
        if self.is_plaintext() {
            return Ok(manifest);
        }
        let crypto = manifest.crypto.as_mut().ok_or_else(|| {
            DbError::InvariantViolation(
                "finalizing a manifest without a crypto block".to_string(),
            )
        })?;
        crypto.nonce = random_hex(16);
        crypto.timestamp = now_millis();
        let signature = self.with_keys(|keys| self.sign_bytes(keys, &manifest))?;
        manifest
            .crypto
            .as_mut()
            .expect("crypto block checked above")
            .signature = hex::encode(signature);
        Ok(manifest)
    }

    /// Check a fetched manifest's signature. For unencrypted databases any
    /// manifest is accepted; for encrypted databases an unsigned manifest is
    /// rejected.
    pub fn verify_manifest(&self, manifest: &Manifest) -> DbResult<()> {
        if self.is_plaintext() {
            return Ok(());
        }
        let crypto = manifest.crypto.as_ref().ok_or_else(|| {
            DbError::CorruptedOrTampered(
                "unsigned manifest for an encrypted database".to_string(),
            )
        })?;
        let claimed = decode_hex(&crypto.signature, "signature")?;
        self.with_keys(|keys| {
            let canonical = manifest.canonical_signing_bytes()?;
            let mut mac = HmacSha256::new_from_slice(keys.sign.as_bytes())
                .map_err(|e| DbError::InternalError(format!("HMAC init failed: {}", e)))?;
            mac.update(&canonical);
            mac.verify_slice(&claimed).map_err(|_| {
                warn!("manifest signature verification failed");
                DbError::CorruptedOrTampered("manifest signature mismatch".to_string())
            })
        })
    }

    /// Register the local device for quick-unlock with `pin`.
    pub async fn register_device(
        &self,
        block: &CryptoBlock,
        pin: &str,
    ) -> DbResult<CryptoBlock> {
        let master =
            self.with_keys(|keys| Ok(KeyMaterial::from_bytes(*keys.master.as_bytes())))?;
        let salt = random_salt();
        let kwk = self.derive_kwk(pin.as_bytes().to_vec(), salt.to_vec()).await?;
        let wrapped = encrypt(&kwk, master.as_bytes(), self.identity.device_id.as_bytes())?;

        let mut blob = Vec::with_capacity(SALT_SIZE + wrapped.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&wrapped);

        let mut next = block.clone();
        next.device_key.insert(
            self.identity.device_id.clone(),
            DeviceKeyEntry {
                key: hex::encode(blob),
                device_name: self.identity.device_name.clone(),
                last_used_at: now_millis(),
            },
        );
        debug!(device = %self.identity.device_id, "registered device for quick unlock");
        Ok(next)
    }

    /// Remove a device from the registry. Future quick-unlocks for it fail;
    /// other entries are untouched.
    pub fn remove_device(&self, block: &CryptoBlock, device_id: &str) -> DbResult<CryptoBlock> {
        let mut next = block.clone();
        if next.device_key.remove(device_id).is_none() {
            return Err(DbError::NotFound(format!("device '{}'", device_id)));
        }
        Ok(next)
    }

    /// Re-wrap the master key under a new password. The master key itself
    /// is unchanged, so device entries stay valid.
    pub async fn rotate_master(
        &self,
        block: &CryptoBlock,
        old_password: &str,
        new_password: &str,
    ) -> DbResult<CryptoBlock> {
        let master = self.unwrap_master(block, old_password).await?;
        let salt = random_salt();
        let kwk = self
            .derive_kwk(new_password.as_bytes().to_vec(), salt.to_vec())
            .await?;
        let wrapped = encrypt(&kwk, master.as_bytes(), b"master-key")?;

        let mut next = block.clone();
        next.master_key = hex::encode(wrapped);
        next.master_key_salt = hex::encode(salt);
        *self.state.write() = KeyState::Unlocked(KeySet::load(master)?);
        Ok(next)
    }

    /// Re-wrap only the local device's entry under a new PIN, authorized by
    /// the master password.
    pub async fn rotate_device_pin(
        &self,
        block: &CryptoBlock,
        master_password: &str,
        new_pin: &str,
    ) -> DbResult<CryptoBlock> {
        let master = self.unwrap_master(block, master_password).await?;
        *self.state.write() = KeyState::Unlocked(KeySet::load(KeyMaterial::from_bytes(
            *master.as_bytes(),
        ))?);
        self.register_device(block, new_pin).await
    }

    /// Refresh `last_used_at` for the local device. Returns `None` when the
    /// entry is recent enough that no manifest write is warranted.
    pub fn touch_current_device(&self, block: &CryptoBlock) -> Option<CryptoBlock> {
        let entry = block.device_key.get(&self.identity.device_id)?;
        let now = now_millis();
        if now.saturating_sub(entry.last_used_at) < TOUCH_SKIP_WINDOW_MS {
            return None;
        }
        let mut next = block.clone();
        next.device_key
            .get_mut(&self.identity.device_id)
            .expect("entry present above")
            .last_used_at = now;
        Some(next)
    }
}

fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn decode_hex(value: &str, field: &str) -> DbResult<Vec<u8>> {
    hex::decode(value)
        .map_err(|_| DbError::CorruptedOrTampered(format!("malformed hex in {}", field)))
}
