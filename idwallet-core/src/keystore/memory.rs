//! In-memory keystore with a scriptable authentication prompt.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AccessPolicy, BiometryType, KeystoreError, SecureKeystore};

/// What the simulated OS prompt does when a presence-gated item is
/// read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptBehavior {
    /// The user authenticates successfully.
    #[default]
    Allow,
    /// The user dismisses the prompt.
    Cancel,
    /// Biometry is unavailable (not enrolled, OS lockout).
    Unavailable,
}

/// An in-process [`SecureKeystore`].
///
/// Items stored with a user-presence policy consult the configured
/// [`PromptBehavior`] on read, so unlock-flow tests can exercise the
/// cancel and unavailable branches deterministically.
pub struct MemoryKeystore {
    items: Mutex<HashMap<String, (Vec<u8>, AccessPolicy)>>,
    prompt: Mutex<PromptBehavior>,
    biometry: BiometryType,
}

impl MemoryKeystore {
    /// Creates a keystore reporting the given biometric capability.
    #[must_use]
    pub fn new(biometry: BiometryType) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            prompt: Mutex::new(PromptBehavior::default()),
            biometry,
        }
    }

    /// Sets the behavior of the next (and subsequent) simulated
    /// prompts.
    pub fn set_prompt_behavior(&self, behavior: PromptBehavior) {
        *self.prompt.lock().expect("prompt poisoned") = behavior;
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new(BiometryType::Fingerprint)
    }
}

#[async_trait]
impl SecureKeystore for MemoryKeystore {
    async fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        let items = self.items.lock().expect("items poisoned");
        let Some((value, policy)) = items.get(id) else {
            return Ok(None);
        };
        if policy.require_user_presence {
            match *self.prompt.lock().expect("prompt poisoned") {
                PromptBehavior::Allow => {}
                PromptBehavior::Cancel => return Err(KeystoreError::UserCancelled),
                PromptBehavior::Unavailable => return Err(KeystoreError::BiometricUnavailable),
            }
        }
        Ok(Some(value.clone()))
    }

    async fn set_item(
        &self,
        id: &str,
        value: &[u8],
        policy: AccessPolicy,
    ) -> Result<(), KeystoreError> {
        self.items
            .lock()
            .expect("items poisoned")
            .insert(id.to_string(), (value.to_vec(), policy));
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> Result<(), KeystoreError> {
        self.items.lock().expect("items poisoned").remove(id);
        Ok(())
    }

    fn biometry_type(&self) -> BiometryType {
        self.biometry
    }
}
