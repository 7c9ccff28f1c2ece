//! Secure-element driver abstraction.
//!
//! Hardware-backed credential keys are generated and used inside a
//! dedicated secure module; only sign and public-key operations are
//! exposed, never the private material. The platform driver implements
//! [`SecureElement`]; [`SoftwareSecureElement`] stands in for it in
//! tests and in flows where the policy allows software backing.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Errors from the secure-element driver.
#[derive(Debug, Error)]
pub enum SecureElementError {
    /// No key pair exists under this identifier.
    #[error("unknown secure-element key: {0}")]
    UnknownKey(String),

    /// A key pair already exists under this identifier.
    #[error("secure-element key already exists: {0}")]
    KeyExists(String),

    /// Driver or hardware failure.
    #[error("secure element error: {0}")]
    Backend(String),
}

/// The platform secure-element driver.
///
/// Key generation can require a user prompt and is potentially
/// long-running, so operations are async.
#[async_trait]
pub trait SecureElement: Send + Sync {
    /// Generates a P-256 key pair under `key_id` and returns the
    /// uncompressed SEC1 public key (65 bytes).
    ///
    /// `hardware_backed` requests that the private key be confined to
    /// the secure hardware; drivers must fail rather than silently
    /// fall back to software when it is set.
    ///
    /// # Errors
    ///
    /// Returns [`SecureElementError::KeyExists`] if `key_id` is taken.
    async fn generate_keypair(
        &self,
        key_id: &str,
        hardware_backed: bool,
    ) -> Result<Vec<u8>, SecureElementError>;

    /// Signs `message` with the key under `key_id`, returning the raw
    /// 64-byte `r || s` ECDSA signature.
    ///
    /// # Errors
    ///
    /// Returns [`SecureElementError::UnknownKey`] if no key exists.
    async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, SecureElementError>;

    /// Returns the uncompressed SEC1 public key for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureElementError::UnknownKey`] if no key exists.
    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, SecureElementError>;

    /// Destroys the key pair under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureElementError::UnknownKey`] if no key exists.
    async fn delete_keypair(&self, key_id: &str) -> Result<(), SecureElementError>;
}

/// A software [`SecureElement`] over in-process P-256 keys.
#[derive(Default)]
pub struct SoftwareSecureElement {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl SoftwareSecureElement {
    /// Creates an empty key table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key pairs currently held. Test observability.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.lock().expect("key table poisoned").len()
    }
}

#[async_trait]
impl SecureElement for SoftwareSecureElement {
    async fn generate_keypair(
        &self,
        key_id: &str,
        _hardware_backed: bool,
    ) -> Result<Vec<u8>, SecureElementError> {
        let mut keys = self.keys.lock().expect("key table poisoned");
        if keys.contains_key(key_id) {
            return Err(SecureElementError::KeyExists(key_id.to_string()));
        }
        let signing_key = SigningKey::random(&mut OsRng);
        let public = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        keys.insert(key_id.to_string(), signing_key);
        Ok(public)
    }

    async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, SecureElementError> {
        let keys = self.keys.lock().expect("key table poisoned");
        let signing_key = keys
            .get(key_id)
            .ok_or_else(|| SecureElementError::UnknownKey(key_id.to_string()))?;
        let signature: Signature = signing_key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, SecureElementError> {
        let keys = self.keys.lock().expect("key table poisoned");
        let signing_key = keys
            .get(key_id)
            .ok_or_else(|| SecureElementError::UnknownKey(key_id.to_string()))?;
        Ok(signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    async fn delete_keypair(&self, key_id: &str) -> Result<(), SecureElementError> {
        self.keys
            .lock()
            .expect("key table poisoned")
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| SecureElementError::UnknownKey(key_id.to_string()))
    }
}
