//! `provisioner-crypto`: secret handling for provisioning.
//!
//! Decoupled from HTTP and storage. Callers get:
//! - authenticated encryption of secrets at rest ([`EncryptionService`])
//! - one-way hashing of bearer tokens ([`hash_token`])
//! - secure token/password generation
//! - constant-time comparison and HMAC signing helpers

pub mod cipher;
pub mod error;
pub mod token;

pub use cipher::{EncryptedSecret, EncryptionService, KEY_LEN, NONCE_LEN};
pub use error::CryptoError;
pub use token::{
    constant_time_eq, generate_password, generate_secure_token, hash_token, hmac_sha256_hex,
};
