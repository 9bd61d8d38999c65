//! Crypto envelope
//!
//! Master-key derivation, per-device wrapping keys, AES-GCM record
//! encryption, and the HMAC signature over the manifest. See
//! [`manager::CryptoManager`] for the operations exposed to the engines.

pub mod cipher;
pub mod kdf;
pub mod manager;

pub use cipher::{NONCE_SIZE, TAG_SIZE};
pub use kdf::{KeyMaterial, SubkeyPurpose, KEY_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};
pub use manager::{CryptoManager, DeviceIdentity, TOUCH_SKIP_WINDOW_MS};
