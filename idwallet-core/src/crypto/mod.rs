//! Cryptographic primitives: PIN key derivation and AEAD encryption.

mod cipher;
mod kdf;

pub use cipher::{
    CipherService, KeyId, KeyResolver, SeedKeyResolver, StaticKeyResolver, NONCE_SIZE,
};
pub use kdf::{generate_salt, KdfEngine, KdfParams, DERIVED_KEY_SIZE, MIN_SALT_LEN};

use thiserror::Error;

/// Errors from the KDF engine and the AEAD cipher service.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Malformed KDF input (empty PIN, short salt). Programmer error;
    /// the derivation never partially succeeds.
    #[error("invalid KDF input: {0}")]
    KdfInput(String),

    /// The KDF backend rejected its parameters.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD tag mismatch: wrong key, tampered ciphertext, or wrong
    /// nonce. No partial plaintext is ever surfaced.
    #[error("authentication failed")]
    Authentication,

    /// The cipher service has no key under this identifier.
    #[error("unknown key id: {0}")]
    UnknownKey(String),
}
