//! OS-protected secret store abstraction.
//!
//! The platform keystore holds small secrets (the wallet key, the KDF
//! salt) under OS protection. Items can be gated behind a biometric or
//! device-credential prompt, so reads are async and can fail because
//! the user cancelled rather than because anything is wrong.
//!
//! Platform implementations live outside this crate:
//! - iOS: Keychain Services with access control flags
//! - Android: Android Keystore + BiometricPrompt
//!
//! [`MemoryKeystore`] is the in-process implementation used by tests
//! and software-only flows.

mod memory;

pub use memory::{MemoryKeystore, PromptBehavior};

use async_trait::async_trait;
use thiserror::Error;

/// Biometric capability of the device, resolved once from the platform
/// capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BiometryType {
    /// Face recognition (Face ID class).
    Face,
    /// Fingerprint sensor.
    Fingerprint,
    /// No usable biometry on this device.
    Unavailable,
}

/// Protection policy for a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    /// Gate reads behind a biometric or device-credential prompt.
    pub require_user_presence: bool,
}

impl AccessPolicy {
    /// Policy requiring a user-presence prompt on read.
    #[must_use]
    pub const fn user_presence() -> Self {
        Self {
            require_user_presence: true,
        }
    }
}

/// Errors from the platform keystore.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeystoreError {
    /// The user dismissed the biometric/device-credential prompt.
    /// Recoverable; no lockout penalty.
    #[error("user cancelled authentication prompt")]
    UserCancelled,

    /// The item requires biometry but none is available (not enrolled,
    /// hardware missing, temporarily locked out by the OS).
    #[error("biometric authentication unavailable")]
    BiometricUnavailable,

    /// Platform keystore failure.
    #[error("keystore backend error: {0}")]
    Backend(String),
}

/// The OS-protected secret store.
///
/// `get_item` may suspend while the OS shows an authentication prompt
/// for items stored with [`AccessPolicy::user_presence`].
#[async_trait]
pub trait SecureKeystore: Send + Sync {
    /// Reads an item, prompting the user if the item's policy requires
    /// presence.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::UserCancelled`] or
    /// [`KeystoreError::BiometricUnavailable`] for gated items, and
    /// [`KeystoreError::Backend`] on platform failure.
    async fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, KeystoreError>;

    /// Writes an item under the given protection policy, replacing any
    /// existing value.
    async fn set_item(
        &self,
        id: &str,
        value: &[u8],
        policy: AccessPolicy,
    ) -> Result<(), KeystoreError>;

    /// Deletes an item. Deleting a missing item is a no-op.
    async fn delete_item(&self, id: &str) -> Result<(), KeystoreError>;

    /// The device's biometric capability.
    fn biometry_type(&self) -> BiometryType;
}
