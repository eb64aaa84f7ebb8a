//! Authenticated encryption of secrets at rest.
//!
//! XChaCha20-Poly1305: 256-bit key, 192-bit nonce. The nonce space is large
//! enough that drawing a fresh random nonce per call is safe for the lifetime
//! of a key, so [`EncryptionService::encrypt`] always generates its own nonce
//! and no API accepts one for encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Hex-encoded ciphertext (with tag) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub nonce: String,
}

#[derive(Clone)]
pub struct EncryptionService {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService").finish_non_exhaustive()
    }
}

impl EncryptionService {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Build from a 64-character hex master key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not hex: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Encrypt under a freshly drawn nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedSecret {
            ciphertext: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
        })
    }

    /// Decrypt and authenticate. Any tampering yields `DecryptionFailed`.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, CryptoError> {
        let nonce_bytes = hex::decode(&secret.nonce).map_err(|_| CryptoError::DecryptionFailed)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let ciphertext =
            hex::decode(&secret.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}
