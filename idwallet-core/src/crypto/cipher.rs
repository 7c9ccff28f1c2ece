//! Key-identifier-parameterized AEAD encryption.
//!
//! Ciphers never take raw key bytes at the call site. A [`CipherService`]
//! is built over a [`KeyResolver`] that maps a [`KeyId`] to key material
//! at call time, either from a platform-held key table or from a
//! deterministic seed expansion for software-simulated keys.
//!
//! XChaCha20-Poly1305 with 24-byte nonces, as used for the record
//! store's own envelope encryption.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::CryptoError;

/// AEAD nonce size in bytes (XChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 24;

/// Domain separation label for seed-derived cipher keys.
const SEED_EXPAND_LABEL: &[u8] = b"idwallet:cipher-key";

/// A named symmetric key held by a [`KeyResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId(String);

impl KeyId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves a [`KeyId`] to 32 bytes of symmetric key material.
///
/// Implementations stand in for the platform key table (hardware-held
/// keys) or derive keys deterministically from a seed.
pub trait KeyResolver: Send + Sync {
    /// Resolves the key for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKey`] if no key exists under `id`.
    fn resolve(&self, id: &KeyId) -> Result<Zeroizing<[u8; 32]>, CryptoError>;
}

/// Derives per-id keys from a single seed via HKDF-SHA256.
///
/// Every [`KeyId`] resolves, each to a distinct key. Used for
/// software-simulated keys in lower-assurance flows.
pub struct SeedKeyResolver {
    seed: Zeroizing<[u8; 32]>,
}

impl SeedKeyResolver {
    /// Creates a resolver over the given seed.
    #[must_use]
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
        }
    }
}

impl KeyResolver for SeedKeyResolver {
    fn resolve(&self, id: &KeyId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(SEED_EXPAND_LABEL), self.seed.as_ref());
        let mut key = Zeroizing::new([0u8; 32]);
        hkdf.expand(id.as_str().as_bytes(), key.as_mut())
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".into()))?;
        Ok(key)
    }
}

/// A resolver over an explicit key table.
///
/// Models hardware-resident keys: callers register material once and
/// afterwards address it only by id.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: Mutex<HashMap<KeyId, Zeroizing<[u8; 32]>>>,
}

impl StaticKeyResolver {
    /// Creates an empty key table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers key material under `id`, replacing any existing entry.
    pub fn register(&self, id: KeyId, key: [u8; 32]) {
        self.keys
            .lock()
            .expect("key table poisoned")
            .insert(id, Zeroizing::new(key));
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve(&self, id: &KeyId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.keys
            .lock()
            .expect("key table poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownKey(id.to_string()))
    }
}

/// AEAD encrypt/decrypt over resolver-held keys.
#[derive(Clone)]
pub struct CipherService {
    resolver: Arc<dyn KeyResolver>,
}

impl CipherService {
    /// Creates a service over the given resolver.
    #[must_use]
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    /// Encrypts `plaintext` under the key named by `key_id`.
    ///
    /// When `nonce` is `None` the nonce is derived as the first 24
    /// bytes of SHA-256(plaintext). This makes encryption deterministic
    /// and is required verbatim by the authenticated-channel PID
    /// issuance protocol, which re-derives the same `pinSecret` from
    /// the same PIN across calls. It is a protocol constraint, not a
    /// general AEAD pattern; pass an explicit random nonce everywhere
    /// else.
    ///
    /// Returns `(ciphertext || tag, nonce)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKey`] if the key cannot be
    /// resolved and [`CryptoError::Encryption`] if the AEAD fails.
    pub fn encrypt(
        &self,
        key_id: &KeyId,
        plaintext: &[u8],
        nonce: Option<[u8; NONCE_SIZE]>,
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
        let key = self.resolver.resolve(key_id)?;
        let cipher =
            XChaCha20Poly1305::new_from_slice(key.as_ref()).expect("key length is always 32");

        let nonce_bytes = nonce.unwrap_or_else(|| derive_nonce(plaintext));
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Encryption("XChaCha20-Poly1305 encryption failed".into()))?;

        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypts `ciphertext || tag` under the key named by `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKey`] if the key cannot be
    /// resolved and [`CryptoError::Authentication`] on tag mismatch.
    /// No partial plaintext is ever returned.
    pub fn decrypt(
        &self,
        key_id: &KeyId,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.resolver.resolve(key_id)?;
        let cipher =
            XChaCha20Poly1305::new_from_slice(key.as_ref()).expect("key length is always 32");

        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

/// Derives the deterministic nonce: SHA-256(plaintext) truncated to 24
/// bytes. See [`CipherService::encrypt`] for why this exists.
fn derive_nonce(plaintext: &[u8]) -> [u8; NONCE_SIZE] {
    let hash = Sha256::digest(plaintext);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hash[..NONCE_SIZE]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn service() -> CipherService {
        CipherService::new(Arc::new(SeedKeyResolver::new([7u8; 32])))
    }

    #[test]
    fn test_round_trip() {
        let service = service();
        let key_id = KeyId::new("k0");
        let plaintext = b"six digit pin";

        let (ciphertext, nonce) = service.encrypt(&key_id, plaintext, None).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + 16);

        let decrypted = service.decrypt(&key_id, &ciphertext, &nonce).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let service = service();
        let key_id = KeyId::new("k0");
        let (mut ciphertext, nonce) = service.encrypt(&key_id, b"payload", None).unwrap();

        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                service.decrypt(&key_id, &tampered, &nonce),
                Err(CryptoError::Authentication)
            ));
        }

        // Also flip a bit of the tag region explicitly.
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x80;
        assert!(matches!(
            service.decrypt(&key_id, &ciphertext, &nonce),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_deterministic_nonce_reproduces_ciphertext() {
        let service = service();
        let key_id = KeyId::new("pin-secret");

        let (first, nonce_a) = service.encrypt(&key_id, b"276536", None).unwrap();
        let (second, nonce_b) = service.encrypt(&key_id, b"276536", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(nonce_a, nonce_b);

        let (other, _) = service.encrypt(&key_id, b"276537", None).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_explicit_nonce_respected() {
        let service = service();
        let key_id = KeyId::new("k0");
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let (ciphertext, used) = service.encrypt(&key_id, b"data", Some(nonce)).unwrap();
        assert_eq!(used, nonce);
        assert_eq!(service.decrypt(&key_id, &ciphertext, &nonce).unwrap(), b"data");
    }

    #[test]
    fn test_seed_resolver_distinct_keys_per_id() {
        let service = service();
        let (a, _) = service.encrypt(&KeyId::new("a"), b"data", None).unwrap();
        let (b, _) = service.encrypt(&KeyId::new("b"), b"data", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_static_resolver_unknown_key() {
        let service = CipherService::new(Arc::new(StaticKeyResolver::new()));
        let result = service.encrypt(&KeyId::new("missing"), b"data", None);
        assert!(matches!(result, Err(CryptoError::UnknownKey(_))));
    }

    #[test]
    fn test_static_resolver_registered_key() {
        let resolver = Arc::new(StaticKeyResolver::new());
        resolver.register(KeyId::new("hw"), [9u8; 32]);
        let service = CipherService::new(resolver);

        let (ciphertext, nonce) = service.encrypt(&KeyId::new("hw"), b"data", None).unwrap();
        assert_eq!(
            service.decrypt(&KeyId::new("hw"), &ciphertext, &nonce).unwrap(),
            b"data"
        );
    }
}
