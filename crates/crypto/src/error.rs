use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material had the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    EncryptionFailed,

    /// Authentication tag mismatch, wrong key, or malformed ciphertext/nonce.
    #[error("decryption failed")]
    DecryptionFailed,
}
