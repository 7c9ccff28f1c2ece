//! JSON Web Key and DID rendering of P-256 public keys.
//!
//! All credential and proof keys in the wallet are P-256, carried on
//! the wire either as a bare JWK or as a `did:jwk` / `did:key`
//! identifier derived from the same point.

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Multicodec prefix for a compressed P-256 public key, as used by
/// `did:key`.
const P256_MULTICODEC: [u8; 2] = [0x80, 0x24];

/// Errors from public-key rendering.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwkError {
    /// The input is not a 65-byte uncompressed SEC1 point.
    #[error("expected a 65-byte uncompressed SEC1 public key, got {0} bytes")]
    InvalidPublicKey(usize),
}

/// A public P-256 key in JWK form.
///
/// Field order matters for `did:jwk`: the DID embeds the serialized
/// JSON, and peers canonicalize on `crv`, `kty`, `x`, `y`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    /// Curve name, always `P-256`.
    pub crv: String,
    /// Key type, always `EC`.
    pub kty: String,
    /// Base64url x coordinate.
    pub x: String,
    /// Base64url y coordinate.
    pub y: String,
}

impl PublicJwk {
    /// Builds a JWK from an uncompressed SEC1 public key.
    ///
    /// # Errors
    ///
    /// Returns [`JwkError::InvalidPublicKey`] unless the input is the
    /// 65-byte `0x04 || x || y` encoding.
    pub fn from_sec1(public_key: &[u8]) -> Result<Self, JwkError> {
        if public_key.len() != 65 || public_key[0] != 0x04 {
            return Err(JwkError::InvalidPublicKey(public_key.len()));
        }
        Ok(Self {
            crv: "P-256".to_string(),
            kty: "EC".to_string(),
            x: BASE64_URL_SAFE_NO_PAD.encode(&public_key[1..33]),
            y: BASE64_URL_SAFE_NO_PAD.encode(&public_key[33..65]),
        })
    }

    /// Renders the key as a `did:jwk` identifier.
    ///
    /// # Errors
    ///
    /// Serialization of this struct cannot fail in practice; an error
    /// is still surfaced rather than panicking.
    pub fn to_did_jwk(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("did:jwk:{}", BASE64_URL_SAFE_NO_PAD.encode(json)))
    }
}

/// Renders an uncompressed SEC1 public key as a `did:key` identifier
/// (multibase base58btc over the P-256 multicodec and the compressed
/// point).
///
/// # Errors
///
/// Returns [`JwkError::InvalidPublicKey`] unless the input is the
/// 65-byte uncompressed encoding.
pub fn to_did_key(public_key: &[u8]) -> Result<String, JwkError> {
    if public_key.len() != 65 || public_key[0] != 0x04 {
        return Err(JwkError::InvalidPublicKey(public_key.len()));
    }
    // Compress: 0x02/0x03 prefix by y parity, then x.
    let mut compressed = Vec::with_capacity(35);
    compressed.extend_from_slice(&P256_MULTICODEC);
    compressed.push(if public_key[64] & 1 == 0 { 0x02 } else { 0x03 });
    compressed.extend_from_slice(&public_key[1..33]);
    Ok(format!("did:key:z{}", bs58::encode(compressed).into_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn sample_public_key() -> Vec<u8> {
        SigningKey::random(&mut OsRng)
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_jwk_from_sec1() {
        let public = sample_public_key();
        let jwk = PublicJwk::from_sec1(&public).unwrap();
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.crv, "P-256");
        assert_eq!(BASE64_URL_SAFE_NO_PAD.decode(&jwk.x).unwrap(), public[1..33]);
        assert_eq!(BASE64_URL_SAFE_NO_PAD.decode(&jwk.y).unwrap(), public[33..65]);
    }

    #[test]
    fn test_rejects_compressed_point() {
        let public = sample_public_key();
        let compressed = p256::ecdsa::VerifyingKey::from_sec1_bytes(&public)
            .unwrap()
            .to_encoded_point(true);
        assert_eq!(
            PublicJwk::from_sec1(compressed.as_bytes()),
            Err(JwkError::InvalidPublicKey(33))
        );
        assert_eq!(
            to_did_key(compressed.as_bytes()),
            Err(JwkError::InvalidPublicKey(33))
        );
    }

    #[test]
    fn test_did_jwk_embeds_key() {
        let public = sample_public_key();
        let jwk = PublicJwk::from_sec1(&public).unwrap();
        let did = jwk.to_did_jwk().unwrap();
        let encoded = did.strip_prefix("did:jwk:").unwrap();
        let decoded: PublicJwk =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, jwk);
    }

    #[test]
    fn test_did_key_prefix_and_roundtrip() {
        let public = sample_public_key();
        let did = to_did_key(&public).unwrap();
        let encoded = did.strip_prefix("did:key:z").unwrap();
        let decoded = bs58::decode(encoded).into_vec().unwrap();
        assert_eq!(decoded[..2], P256_MULTICODEC);
        assert!(decoded[2] == 0x02 || decoded[2] == 0x03);
        assert_eq!(decoded[3..], public[1..33]);
    }
}
