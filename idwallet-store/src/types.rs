//! Core type definitions for the record-store layer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{StoreError, StoreResult};

/// How a store's wallet key was produced.
///
/// The scheme is fixed when the store is provisioned and is part of the
/// store's identity. Opening a store under the wrong scheme fails before
/// any key check is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyWrapScheme {
    /// The wallet key is random bytes held in the OS secret store.
    Raw,
    /// The wallet key is derived from a PIN with a memory-hard KDF.
    KdfDerived,
}

impl fmt::Display for KeyWrapScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::KdfDerived => write!(f, "kdf-derived"),
        }
    }
}

/// A versioned store identifier, rendered as `{product}-wallet-{version}`.
///
/// A version bump is the only supported key-rotation mechanism: a new
/// wallet key means a new `StoreId` and a migration, never in-place
/// re-encryption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    product: String,
    version: u32,
}

impl StoreId {
    /// Creates a store identifier for the given product and version.
    #[must_use]
    pub fn new(product: impl Into<String>, version: u32) -> Self {
        Self {
            product: product.into(),
            version,
        }
    }

    /// The product prefix.
    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    /// The store version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// The same product at a bumped version, for migration targets.
    #[must_use]
    pub fn next_version(&self) -> Self {
        Self {
            product: self.product.clone(),
            version: self.version + 1,
        }
    }

    /// The on-disk location of this store: `{data_path}/wallet/{store_id}/`.
    #[must_use]
    pub fn path_under(&self, data_path: &Path) -> PathBuf {
        data_path.join("wallet").join(self.to_string())
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-wallet-{}", self.product, self.version)
    }
}

/// The symmetric key that opens a store (the wallet key, from the
/// driver's point of view).
///
/// Zeroized on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PassKey([u8; 32]);

impl PassKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassKey").field("key", &"[REDACTED]").finish()
    }
}

/// A data record in the store.
///
/// Values are opaque encrypted-at-rest bytes from the driver's point of
/// view; the core encodes them as CBOR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier, unique within its category.
    pub id: String,
    /// Record category (e.g. `"salt"`, `"credential"`).
    pub category: String,
    /// Encoded record value.
    pub value: Vec<u8>,
    /// Queryable tags, preserved verbatim across migration.
    pub tags: BTreeMap<String, String>,
}

impl Record {
    /// Builds a record with a CBOR-encoded value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the value cannot be
    /// CBOR-encoded.
    pub fn with_cbor_value<T: Serialize>(
        id: impl Into<String>,
        category: impl Into<String>,
        value: &T,
    ) -> StoreResult<Self> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(value, &mut bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            category: category.into(),
            value: bytes,
            tags: BTreeMap::new(),
        })
    }

    /// Decodes the CBOR value of this record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the value is not valid
    /// CBOR for `T`.
    pub fn decode_cbor_value<T: DeserializeOwned>(&self) -> StoreResult<T> {
        ciborium::de::from_reader(self.value.as_slice())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Adds a tag, returning the record for chaining.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A key-table entry: a named public key plus its wrapped secret half.
///
/// For hardware-backed keys `wrapped_secret` is empty and the secret
/// half lives in the secure element, addressed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Key identifier, unique within the store.
    pub name: String,
    /// Key algorithm label (e.g. `"p256"`).
    pub algorithm: String,
    /// Public key bytes (SEC1 for EC keys).
    pub public_key: Vec<u8>,
    /// Wrapped private key material; empty for hardware-backed keys.
    pub wrapped_secret: Vec<u8>,
    /// Queryable tags, preserved verbatim across migration.
    pub tags: BTreeMap<String, String>,
}

/// A tag-equality filter for `fetch_all` / `fetch_all_keys`.
///
/// An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    required: BTreeMap<String, String>,
}

impl TagFilter {
    /// A filter matching every record.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Requires `key == value` on matched items.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.insert(key.into(), value.into());
        self
    }

    /// Whether the given tag set satisfies this filter.
    #[must_use]
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(k, v)| tags.get(k).is_some_and(|t| t == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_id_naming() {
        let id = StoreId::new("idwallet", 2);
        assert_eq!(id.to_string(), "idwallet-wallet-2");
        assert_eq!(id.next_version().to_string(), "idwallet-wallet-3");

        let path = id.path_under(Path::new("/data"));
        assert_eq!(path, PathBuf::from("/data/wallet/idwallet-wallet-2"));
    }

    #[test]
    fn test_record_cbor_round_trip() {
        let record = Record::with_cbor_value("salt", "config", &vec![1u8, 2, 3])
            .unwrap()
            .with_tag("kind", "salt");
        let value: Vec<u8> = record.decode_cbor_value().unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn test_tag_filter() {
        let mut tags = BTreeMap::new();
        tags.insert("scheme".to_string(), "pid".to_string());
        tags.insert("backing".to_string(), "hardware".to_string());

        assert!(TagFilter::any().matches(&tags));
        assert!(TagFilter::any().with("scheme", "pid").matches(&tags));
        assert!(!TagFilter::any().with("scheme", "mdl").matches(&tags));
        assert!(!TagFilter::any().with("missing", "x").matches(&tags));
    }

    #[test]
    fn test_pass_key_debug_redacted() {
        let key = PassKey::from_bytes([0x42; 32]);
        assert!(!format!("{key:?}").contains("42"));
    }
}
