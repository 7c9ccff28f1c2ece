//! PIN-derived ephemeral keys for authenticated-channel PID issuance.
//!
//! High-assurance PID issuance runs over an authenticated channel that
//! requires the wallet to prove knowledge of the user's PIN without
//! sending it. The wallet derives an ephemeral P-256 key pair from the
//! PIN and a long-term device AEAD key, then presents a signed
//! proof-of-possession JWT binding that ephemeral public key, the
//! device key, the issuer audience, and the server's session nonce.
//!
//! The derivation is deliberately deterministic: the issuance server
//! re-derives nothing, but the wallet must reproduce the same key pair
//! every time the same PIN is entered within a session. That is why
//! the PIN secret is encrypted with the plaintext-hash nonce path of
//! [`CipherService::encrypt`] rather than a random nonce.
//!
//! Key pairs and proofs are single-use per issuance session and are
//! dropped after the token exchange.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use p256::ecdsa::SigningKey;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{CipherService, CryptoError, KdfEngine, KeyId};
use crate::jwk::{JwkError, PublicJwk};
use crate::secure_element::{SecureElement, SecureElementError};

/// Errors from the PIN-derived key protocol.
#[derive(Debug, Error)]
pub enum PidError {
    /// KDF or AEAD failure while deriving the ephemeral key.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Device-key signing failure.
    #[error(transparent)]
    SecureElement(#[from] SecureElementError),

    /// Malformed public key from the secure element.
    #[error(transparent)]
    Jwk(#[from] JwkError),

    /// JWT serialization failure.
    #[error("failed to serialize proof of possession: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A transient P-256 key pair derived from the user's PIN.
///
/// Lives only for the duration of one issuance session; never
/// persisted.
pub struct EphemeralPinKeyPair {
    signing_key: SigningKey,
}

impl EphemeralPinKeyPair {
    /// The uncompressed SEC1 public key.
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// The public key in JWK form, as carried in the proof.
    ///
    /// # Errors
    ///
    /// Cannot fail for keys produced by this module; surfaced for
    /// signature uniformity.
    pub fn public_jwk(&self) -> Result<PublicJwk, JwkError> {
        PublicJwk::from_sec1(&self.public_key())
    }
}

impl fmt::Debug for EphemeralPinKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralPinKeyPair")
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
struct ProofHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    jwk: &'a PublicJwk,
}

#[derive(Serialize)]
struct ProofClaims<'a> {
    aud: &'a str,
    iat: u64,
    #[serde(rename = "cNonce")]
    c_nonce: &'a str,
    pin_derived_eph_pub: PublicJwk,
}

/// Derives ephemeral PIN keys and signs their proofs of possession.
pub struct PinKeyProtocol {
    cipher: CipherService,
    kdf: KdfEngine,
    device_key_id: KeyId,
}

impl PinKeyProtocol {
    /// Creates a protocol instance over the long-term device AEAD key
    /// named by `device_key_id`.
    #[must_use]
    pub const fn new(cipher: CipherService, kdf: KdfEngine, device_key_id: KeyId) -> Self {
        Self {
            cipher,
            kdf,
            device_key_id,
        }
    }

    /// Derives the ephemeral key pair for `pin`.
    ///
    /// The PIN digits are AEAD-encrypted under the device key with the
    /// deterministic nonce to obtain a `pinSecret`; `(pin, pinSecret)`
    /// is then fed through the KDF and the output used as the P-256
    /// scalar seed. Deterministic per `(pin, device key)`: the same PIN
    /// reproduces the same key pair until the device key rotates.
    ///
    /// # Errors
    ///
    /// Propagates AEAD and KDF failures; never returns a partial key.
    pub fn derive_keypair_from_pin(
        &self,
        pin: &SecretString,
    ) -> Result<EphemeralPinKeyPair, PidError> {
        let pin_bytes = pin.expose_secret().as_bytes();
        let (pin_secret, _nonce) = self.cipher.encrypt(&self.device_key_id, pin_bytes, None)?;
        let mut seed = Zeroizing::new(self.kdf.derive(pin_bytes, &pin_secret)?);

        // The KDF output may fall outside the curve order; rehash until
        // it lands on a valid non-zero scalar. Deterministic, and in
        // practice the first candidate is valid.
        let signing_key = loop {
            if let Ok(key) = SigningKey::from_bytes((&*seed).into()) {
                break key;
            }
            *seed = Sha256::digest(*seed).into();
        };

        Ok(EphemeralPinKeyPair { signing_key })
    }

    /// Builds the `pin_derived_eph_key_pop` JWT for a credential
    /// request.
    ///
    /// A compact ES256 JWS signed by the device key held in the secure
    /// element. The header carries the device public key as a JWK; the
    /// claims bind the ephemeral public key, the issuer `audience`, and
    /// the server-issued `c_nonce`.
    ///
    /// # Errors
    ///
    /// Propagates secure-element signing failures and serialization
    /// errors.
    pub async fn create_proof_of_possession(
        &self,
        ephemeral: &EphemeralPinKeyPair,
        secure_element: &dyn SecureElement,
        device_key: &str,
        audience: &str,
        c_nonce: &str,
    ) -> Result<String, PidError> {
        let device_public = secure_element.public_key(device_key).await?;
        let device_jwk = PublicJwk::from_sec1(&device_public)?;

        let header = serde_json::to_vec(&ProofHeader {
            alg: "ES256",
            typ: "JWT",
            jwk: &device_jwk,
        })?;
        let claims = serde_json::to_vec(&ProofClaims {
            aud: audience,
            iat: unix_time(),
            c_nonce,
            pin_derived_eph_pub: ephemeral.public_jwk()?,
        })?;

        let signing_input = format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(header),
            BASE64_URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = secure_element
            .sign(device_key, signing_input.as_bytes())
            .await?;

        Ok(format!(
            "{signing_input}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfParams, SeedKeyResolver};
    use crate::secure_element::SoftwareSecureElement;
    use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
    use std::sync::Arc;

    fn protocol() -> PinKeyProtocol {
        PinKeyProtocol::new(
            CipherService::new(Arc::new(SeedKeyResolver::new([7u8; 32]))),
            KdfEngine::new(KdfParams::test_preset()),
            KeyId::new("device-aead-key"),
        )
    }

    #[test]
    fn test_same_pin_reproduces_keypair() {
        let protocol = protocol();
        let pin = SecretString::from("276536");

        let first = protocol.derive_keypair_from_pin(&pin).unwrap();
        let second = protocol.derive_keypair_from_pin(&pin).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_different_pins_differ() {
        let protocol = protocol();
        let a = protocol
            .derive_keypair_from_pin(&SecretString::from("276536"))
            .unwrap();
        let b = protocol
            .derive_keypair_from_pin(&SecretString::from("276537"))
            .unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_different_device_keys_differ() {
        let kdf = KdfEngine::new(KdfParams::test_preset());
        let pin = SecretString::from("276536");

        let a = PinKeyProtocol::new(
            CipherService::new(Arc::new(SeedKeyResolver::new([1u8; 32]))),
            kdf,
            KeyId::new("device-aead-key"),
        )
        .derive_keypair_from_pin(&pin)
        .unwrap();
        let b = PinKeyProtocol::new(
            CipherService::new(Arc::new(SeedKeyResolver::new([2u8; 32]))),
            kdf,
            KeyId::new("device-aead-key"),
        )
        .derive_keypair_from_pin(&pin)
        .unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_debug_redacts_key() {
        let pair = protocol()
            .derive_keypair_from_pin(&SecretString::from("276536"))
            .unwrap();
        assert!(format!("{pair:?}").contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_proof_of_possession_verifies() {
        let protocol = protocol();
        let se = SoftwareSecureElement::new();
        let device_public = se.generate_keypair("device-key", false).await.unwrap();

        let ephemeral = protocol
            .derive_keypair_from_pin(&SecretString::from("276536"))
            .unwrap();
        let jwt = protocol
            .create_proof_of_possession(
                &ephemeral,
                &se,
                "device-key",
                "https://issuer.example.org",
                "nonce-123",
            )
            .await
            .unwrap();

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        // Header carries the device key, ES256.
        let header: serde_json::Value =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "JWT");
        assert_eq!(
            header["jwk"],
            serde_json::to_value(PublicJwk::from_sec1(&device_public).unwrap()).unwrap()
        );

        // Claims bind the ephemeral key, audience, and nonce.
        let claims: serde_json::Value =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://issuer.example.org");
        assert_eq!(claims["cNonce"], "nonce-123");
        assert_eq!(
            claims["pin_derived_eph_pub"],
            serde_json::to_value(ephemeral.public_jwk().unwrap()).unwrap()
        );
        assert!(claims["iat"].as_u64().unwrap() > 0);

        // The signature verifies under the device public key.
        let verifying_key = VerifyingKey::from_sec1_bytes(&device_public).unwrap();
        let signature =
            Signature::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(parts[2]).unwrap()).unwrap();
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .unwrap();
    }
}
