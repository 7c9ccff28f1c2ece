//! Wallet key material and its home in the OS secret store.
//!
//! Exactly one wallet key is active per wallet version. The raw bytes
//! exist only in process memory and inside the OS-managed secret store;
//! they are never written to the record store or any other non-volatile
//! location.

use std::fmt;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use idwallet_store::{KeyWrapScheme, PassKey, Record, StoreError, StoreSession};

use crate::keystore::{AccessPolicy, KeystoreError, SecureKeystore};

/// Category of the per-wallet salt record.
pub const SALT_RECORD_CATEGORY: &str = "config";

/// Well-known identifier of the per-wallet salt record.
pub const SALT_RECORD_ID: &str = "wallet-salt";

/// The master symmetric key that opens the wallet's record store.
///
/// Tagged with how it was produced; the tag must match the store's
/// provisioned key-wrap scheme.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WalletKeyMaterial {
    bytes: [u8; 32],
    #[zeroize(skip)]
    scheme: KeyWrapScheme,
}

impl WalletKeyMaterial {
    /// Generates a random wallet key (`raw` scheme).
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            bytes,
            scheme: KeyWrapScheme::Raw,
        }
    }

    /// Wraps KDF output as a wallet key (`kdf-derived` scheme).
    #[must_use]
    pub const fn from_kdf(bytes: [u8; 32]) -> Self {
        Self {
            bytes,
            scheme: KeyWrapScheme::KdfDerived,
        }
    }

    /// Reconstructs key material with an explicit scheme tag.
    #[must_use]
    pub const fn from_parts(bytes: [u8; 32], scheme: KeyWrapScheme) -> Self {
        Self { bytes, scheme }
    }

    /// How this key was produced.
    #[must_use]
    pub const fn scheme(&self) -> KeyWrapScheme {
        self.scheme
    }

    /// The raw key bytes. Treat as sensitive material.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The pass key handed to the store driver.
    #[must_use]
    pub const fn pass_key(&self) -> PassKey {
        PassKey::from_bytes(self.bytes)
    }
}

impl PartialEq for WalletKeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time on the key bytes; the scheme tag is public.
        bool::from(self.bytes.ct_eq(&other.bytes)) && self.scheme == other.scheme
    }
}

impl Eq for WalletKeyMaterial {}

impl fmt::Debug for WalletKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeyMaterial")
            .field("key", &"[REDACTED]")
            .field("scheme", &self.scheme)
            .finish()
    }
}

/// Keystore serialization of a wallet key.
#[derive(Serialize, Deserialize)]
struct StoredWalletKey {
    scheme: KeyWrapScheme,
    key: Vec<u8>,
}

/// Persists the wallet key in the OS secret store, scoped to a
/// versioned identifier.
///
/// Reads go through the keystore's biometric gate and can therefore
/// suspend for a prompt or fail with [`KeystoreError::UserCancelled`] /
/// [`KeystoreError::BiometricUnavailable`]. Legacy versions stay in
/// place until migration completes and [`Self::remove`] is called for
/// them explicitly.
pub struct WalletKeyStore {
    keystore: Arc<dyn SecureKeystore>,
    product: String,
}

impl WalletKeyStore {
    /// Creates a store over the platform keystore.
    #[must_use]
    pub fn new(keystore: Arc<dyn SecureKeystore>, product: impl Into<String>) -> Self {
        Self {
            keystore,
            product: product.into(),
        }
    }

    fn key_item_id(&self, version: u32) -> String {
        format!("{}-wallet-key-v{version}", self.product)
    }

    fn salt_item_id(&self, version: u32) -> String {
        format!("{}-wallet-salt-v{version}", self.product)
    }

    /// Reads the wallet key for `version`, prompting for user presence.
    ///
    /// # Errors
    ///
    /// Surfaces the keystore's prompt outcomes and a `Backend` error if
    /// the stored bytes cannot be decoded.
    pub async fn get(&self, version: u32) -> Result<Option<WalletKeyMaterial>, KeystoreError> {
        let Some(bytes) = self.keystore.get_item(&self.key_item_id(version)).await? else {
            return Ok(None);
        };
        let stored: StoredWalletKey = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| KeystoreError::Backend(format!("corrupt wallet key entry: {e}")))?;
        let key: [u8; 32] = stored
            .key
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Backend("wallet key length mismatch".into()))?;
        Ok(Some(WalletKeyMaterial::from_parts(key, stored.scheme)))
    }

    /// Stores the wallet key for `version`, gated behind user presence.
    ///
    /// # Errors
    ///
    /// Returns a `Backend` error if encoding or the platform write
    /// fails.
    pub async fn put(&self, version: u32, material: &WalletKeyMaterial) -> Result<(), KeystoreError> {
        let stored = StoredWalletKey {
            scheme: material.scheme(),
            key: material.as_bytes().to_vec(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&stored, &mut bytes)
            .map_err(|e| KeystoreError::Backend(format!("encode wallet key entry: {e}")))?;
        self.keystore
            .set_item(&self.key_item_id(version), &bytes, AccessPolicy::user_presence())
            .await
    }

    /// Removes the wallet key and salt for `version`. Called for the
    /// legacy version once migration has completed.
    pub async fn remove(&self, version: u32) -> Result<(), KeystoreError> {
        self.keystore.delete_item(&self.key_item_id(version)).await?;
        self.keystore.delete_item(&self.salt_item_id(version)).await
    }

    /// Reads the KDF salt for `version`. Not presence-gated: the salt
    /// is needed before the wallet is unlocked and is not secret.
    pub async fn get_salt(&self, version: u32) -> Result<Option<Vec<u8>>, KeystoreError> {
        self.keystore.get_item(&self.salt_item_id(version)).await
    }

    /// Stores the KDF salt for `version`.
    pub async fn put_salt(&self, version: u32, salt: &[u8]) -> Result<(), KeystoreError> {
        self.keystore
            .set_item(&self.salt_item_id(version), salt, AccessPolicy::default())
            .await
    }
}

/// Ensures the per-wallet salt record exists, inserting `salt` on
/// first need.
///
/// Returns the persisted salt: the record is immutable once written,
/// so an existing record wins over the supplied value.
///
/// # Errors
///
/// Propagates store failures; a corrupt existing record surfaces as
/// [`StoreError::Serialization`].
pub async fn ensure_salt_record(
    session: &mut dyn StoreSession,
    salt: &[u8],
) -> Result<Vec<u8>, StoreError> {
    if let Some(record) = session.fetch(SALT_RECORD_CATEGORY, SALT_RECORD_ID).await? {
        return record.decode_cbor_value::<Vec<u8>>();
    }
    let record = Record::with_cbor_value(SALT_RECORD_ID, SALT_RECORD_CATEGORY, &salt.to_vec())?
        .with_tag("kind", "salt");
    session.insert(record).await?;
    Ok(salt.to_vec())
}
