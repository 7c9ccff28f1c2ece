//! Credential key binding.
//!
//! Every issued credential is bound 1:1 to a fresh signing key. The
//! resolver decides whether that key must be hardware-backed (policy
//! over "sensitive" credential schemes), allocates it, persists its
//! public half in the store's key table, and renders the binding
//! identifier the issuer asked for.
//!
//! Hardware key generation goes through the secure element and may
//! prompt the user, so hardware-required schemes are allocated in
//! batches: one allocation burst fills a per-scheme cache that is then
//! drained one key per issuance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use strum::Display;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use idwallet_store::{KeyEntry, StoreError, StoreSession};

use crate::jwk::{self, JwkError, PublicJwk};
use crate::secure_element::{SecureElement, SecureElementError};

/// Where a credential key's private half lives.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum KeyBacking {
    /// In-process key, acceptable for lower-assurance credentials.
    Software,
    /// Key confined to the secure element.
    Hardware,
}

/// How the credential key is referenced in the issued credential.
///
/// Ordered by preference: `did:jwk` first, then `did:key`, then a bare
/// JWK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMethod {
    /// `did:jwk` identifier embedding the JWK.
    DidJwk,
    /// `did:key` multibase identifier.
    DidKey,
    /// Raw JWK object.
    Jwk,
}

impl BindingMethod {
    /// The capability string issuers advertise for this method.
    #[must_use]
    pub const fn capability(self) -> &'static str {
        match self {
            Self::DidJwk => "did:jwk",
            Self::DidKey => "did:key",
            Self::Jwk => "jwk",
        }
    }

    /// Picks the most preferred method the issuer supports.
    ///
    /// # Errors
    ///
    /// Returns [`BindingError::UnsupportedBindingMethod`] when none of
    /// the advertised capabilities is one we can produce.
    pub fn select(issuer_capabilities: &[String]) -> Result<Self, BindingError> {
        [Self::DidJwk, Self::DidKey, Self::Jwk]
            .into_iter()
            .find(|method| {
                issuer_capabilities
                    .iter()
                    .any(|c| c == method.capability())
            })
            .ok_or_else(|| BindingError::UnsupportedBindingMethod(issuer_capabilities.join(", ")))
    }
}

/// Policy table deciding key backing per credential scheme.
#[derive(Debug, Clone)]
pub struct BindingPolicy {
    sensitive_schemes: HashSet<String>,
    batch_size: usize,
}

impl Default for BindingPolicy {
    /// Software backing for everything, no batching.
    fn default() -> Self {
        Self {
            sensitive_schemes: HashSet::new(),
            batch_size: 1,
        }
    }
}

impl BindingPolicy {
    /// Builds a policy requiring hardware backing for the listed
    /// schemes, allocating hardware keys `batch_size` at a time.
    #[must_use]
    pub fn new<I, S>(sensitive_schemes: I, batch_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sensitive_schemes: sensitive_schemes.into_iter().map(Into::into).collect(),
            batch_size: batch_size.max(1),
        }
    }

    /// The backing required for `scheme`.
    #[must_use]
    pub fn backing_for(&self, scheme: &str) -> KeyBacking {
        if self.sensitive_schemes.contains(scheme) {
            KeyBacking::Hardware
        } else {
            KeyBacking::Software
        }
    }
}

/// A credential key handed out by the resolver.
///
/// The private half stays in the secure element; this record carries
/// the handle, the public key, and the issuer-facing binding
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialKeyRecord {
    /// Secure-element / key-table handle of the key.
    pub key_id: String,
    /// Uncompressed SEC1 public key.
    pub public_key: Vec<u8>,
    /// Where the private half lives.
    pub backing: KeyBacking,
    /// How the key is referenced in the credential.
    pub method: BindingMethod,
    /// The rendered binding: a DID string, or the JWK as JSON for
    /// [`BindingMethod::Jwk`].
    pub binding_id: String,
}

/// Errors from the binding resolver.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The issuer advertises no binding method we support.
    #[error("issuer supports no known binding method (advertised: {0})")]
    UnsupportedBindingMethod(String),

    /// Secure-element failure while allocating or releasing a key.
    #[error(transparent)]
    SecureElement(#[from] SecureElementError),

    /// Key-table persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The secure element returned a malformed public key.
    #[error(transparent)]
    Jwk(#[from] JwkError),

    /// Binding identifier rendering failure.
    #[error("failed to render binding identifier: {0}")]
    Render(#[from] serde_json::Error),
}

struct AllocatedKey {
    key_id: String,
    public_key: Vec<u8>,
}

/// Allocates and tracks credential keys.
pub struct KeyBindingResolver {
    secure_element: Arc<dyn SecureElement>,
    policy: BindingPolicy,
    // Per-scheme cache of pre-allocated hardware keys. Consumption is
    // an atomic pop under this lock; issuance may be parallelized.
    batches: tokio::sync::Mutex<HashMap<String, VecDeque<AllocatedKey>>>,
}

impl KeyBindingResolver {
    /// Creates a resolver over the given secure element and policy.
    #[must_use]
    pub fn new(secure_element: Arc<dyn SecureElement>, policy: BindingPolicy) -> Self {
        Self {
            secure_element,
            policy,
            batches: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a fresh credential key for one issuance of `scheme`.
    ///
    /// Decides the backing from the policy, allocates (or pops a
    /// pre-allocated) key, persists its public half in the session's
    /// key table tagged with scheme and backing, and renders the
    /// binding identifier in the most preferred method the issuer
    /// advertises.
    ///
    /// # Errors
    ///
    /// Fails the issuance attempt on an unsupported binding method,
    /// and propagates secure-element and store errors.
    pub async fn resolve(
        &self,
        session: &mut dyn StoreSession,
        scheme: &str,
        issuer_capabilities: &[String],
    ) -> Result<CredentialKeyRecord, BindingError> {
        let method = BindingMethod::select(issuer_capabilities)?;
        let backing = self.policy.backing_for(scheme);

        let allocated = match backing {
            KeyBacking::Software => {
                let key = self.allocate_one(session, scheme, backing).await?;
                debug!(scheme, key_id = %key.key_id, "allocated software credential key");
                key
            }
            KeyBacking::Hardware => self.pop_or_refill(session, scheme).await?,
        };

        let binding_id = render_binding(method, &allocated.public_key)?;
        Ok(CredentialKeyRecord {
            key_id: allocated.key_id,
            public_key: allocated.public_key,
            backing,
            method,
            binding_id,
        })
    }

    /// Destroys a credential key when its credential is deleted.
    ///
    /// # Errors
    ///
    /// Propagates secure-element and key-table failures.
    pub async fn release(
        &self,
        session: &mut dyn StoreSession,
        key_id: &str,
    ) -> Result<(), BindingError> {
        self.secure_element.delete_keypair(key_id).await?;
        session.remove_key(key_id).await?;
        debug!(key_id, "released credential key");
        Ok(())
    }

    async fn pop_or_refill(
        &self,
        session: &mut dyn StoreSession,
        scheme: &str,
    ) -> Result<AllocatedKey, BindingError> {
        let mut batches = self.batches.lock().await;
        let queue = batches.entry(scheme.to_string()).or_default();
        if queue.is_empty() {
            // One allocation burst; each key may prompt, but batching
            // keeps prompts to issuance bursts instead of every call.
            info!(
                scheme,
                batch_size = self.policy.batch_size,
                "pre-allocating hardware credential key batch"
            );
            for _ in 0..self.policy.batch_size {
                queue.push_back(
                    self.allocate_one(session, scheme, KeyBacking::Hardware)
                        .await?,
                );
            }
        }
        // Non-empty by construction: batch_size is at least 1.
        queue
            .pop_front()
            .ok_or_else(|| BindingError::SecureElement(SecureElementError::Backend(
                "hardware key batch empty after refill".into(),
            )))
    }

    async fn allocate_one(
        &self,
        session: &mut dyn StoreSession,
        scheme: &str,
        backing: KeyBacking,
    ) -> Result<AllocatedKey, BindingError> {
        let key_id = format!("credkey-{}", Uuid::new_v4());
        let public_key = self
            .secure_element
            .generate_keypair(&key_id, backing == KeyBacking::Hardware)
            .await?;
        session
            .insert_key(KeyEntry {
                name: key_id.clone(),
                algorithm: "p256".to_string(),
                public_key: public_key.clone(),
                // The private half never leaves the secure element.
                wrapped_secret: Vec::new(),
                tags: [
                    ("scheme".to_string(), scheme.to_string()),
                    ("backing".to_string(), backing.to_string()),
                ]
                .into(),
            })
            .await?;
        Ok(AllocatedKey { key_id, public_key })
    }
}

fn render_binding(method: BindingMethod, public_key: &[u8]) -> Result<String, BindingError> {
    match method {
        BindingMethod::DidJwk => Ok(PublicJwk::from_sec1(public_key)?.to_did_jwk()?),
        BindingMethod::DidKey => Ok(jwk::to_did_key(public_key)?),
        BindingMethod::Jwk => Ok(serde_json::to_string(&PublicJwk::from_sec1(public_key)?)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_element::SoftwareSecureElement;
    use idwallet_store::{
        KeyWrapScheme, MemoryStoreDriver, PassKey, StoreDriver, StoreId, TagFilter,
    };
    use test_case::test_case;

    const PID_SCHEME: &str = "eu.europa.ec.eudi.pid.1";

    async fn session() -> Box<dyn StoreSession> {
        MemoryStoreDriver::new()
            .provision(
                &StoreId::new("idwallet", 1),
                KeyWrapScheme::Raw,
                &PassKey::from_bytes([7u8; 32]),
                "default",
            )
            .await
            .unwrap()
    }

    fn capabilities(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test_case(&["did:jwk", "did:key", "jwk"], BindingMethod::DidJwk; "prefers did jwk")]
    #[test_case(&["jwk", "did:key"], BindingMethod::DidKey; "did key over bare jwk")]
    #[test_case(&["jwk"], BindingMethod::Jwk; "bare jwk as last resort")]
    fn test_method_preference(advertised: &[&str], expected: BindingMethod) {
        assert_eq!(
            BindingMethod::select(&capabilities(advertised)).unwrap(),
            expected
        );
    }

    #[test]
    fn test_no_supported_method() {
        let err = BindingMethod::select(&capabilities(&["x509_san_dns"])).unwrap_err();
        assert!(matches!(err, BindingError::UnsupportedBindingMethod(_)));
    }

    #[tokio::test]
    async fn test_hardware_batch_allocation() {
        let se = Arc::new(SoftwareSecureElement::new());
        let resolver = KeyBindingResolver::new(
            Arc::clone(&se) as Arc<dyn SecureElement>,
            BindingPolicy::new([PID_SCHEME], 3),
        );
        let mut session = session().await;
        let caps = capabilities(&["did:jwk"]);

        let first = resolver
            .resolve(session.as_mut(), PID_SCHEME, &caps)
            .await
            .unwrap();
        assert_eq!(first.backing, KeyBacking::Hardware);
        // The whole batch was allocated and persisted up front.
        assert_eq!(se.key_count(), 3);
        let entries = session.fetch_all_keys(&TagFilter::any()).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.tags["backing"] == "hardware"));
        assert!(entries.iter().all(|e| e.tags["scheme"] == PID_SCHEME));
        assert!(entries.iter().all(|e| e.wrapped_secret.is_empty()));

        // Two more calls drain the batch without new allocations.
        let second = resolver
            .resolve(session.as_mut(), PID_SCHEME, &caps)
            .await
            .unwrap();
        let third = resolver
            .resolve(session.as_mut(), PID_SCHEME, &caps)
            .await
            .unwrap();
        assert_eq!(se.key_count(), 3);
        assert_ne!(first.key_id, second.key_id);
        assert_ne!(second.key_id, third.key_id);

        // Fourth call triggers a fresh batch.
        resolver
            .resolve(session.as_mut(), PID_SCHEME, &caps)
            .await
            .unwrap();
        assert_eq!(se.key_count(), 6);
    }

    #[tokio::test]
    async fn test_software_single_allocation() {
        let se = Arc::new(SoftwareSecureElement::new());
        let resolver = KeyBindingResolver::new(
            Arc::clone(&se) as Arc<dyn SecureElement>,
            BindingPolicy::new([PID_SCHEME], 5),
        );
        let mut session = session().await;

        let record = resolver
            .resolve(
                session.as_mut(),
                "org.example.loyalty",
                &capabilities(&["jwk"]),
            )
            .await
            .unwrap();
        assert_eq!(record.backing, KeyBacking::Software);
        // No batch for software keys.
        assert_eq!(se.key_count(), 1);
        let entries = session.fetch_all_keys(&TagFilter::any()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tags["backing"], "software");

        // The bare-JWK binding is the JSON of the public key.
        let jwk: PublicJwk = serde_json::from_str(&record.binding_id).unwrap();
        assert_eq!(jwk, PublicJwk::from_sec1(&record.public_key).unwrap());
    }

    #[tokio::test]
    async fn test_binding_ids_match_method() {
        let se = Arc::new(SoftwareSecureElement::new());
        let resolver = KeyBindingResolver::new(
            Arc::clone(&se) as Arc<dyn SecureElement>,
            BindingPolicy::default(),
        );
        let mut session = session().await;

        let did_jwk = resolver
            .resolve(session.as_mut(), "a", &capabilities(&["did:jwk"]))
            .await
            .unwrap();
        assert!(did_jwk.binding_id.starts_with("did:jwk:"));

        let did_key = resolver
            .resolve(session.as_mut(), "b", &capabilities(&["did:key"]))
            .await
            .unwrap();
        assert!(did_key.binding_id.starts_with("did:key:z"));
    }

    #[tokio::test]
    async fn test_release_destroys_key_everywhere() {
        let se = Arc::new(SoftwareSecureElement::new());
        let resolver = KeyBindingResolver::new(
            Arc::clone(&se) as Arc<dyn SecureElement>,
            BindingPolicy::default(),
        );
        let mut session = session().await;

        let record = resolver
            .resolve(session.as_mut(), "a", &capabilities(&["jwk"]))
            .await
            .unwrap();
        assert_eq!(se.key_count(), 1);

        resolver
            .release(session.as_mut(), &record.key_id)
            .await
            .unwrap();
        assert_eq!(se.key_count(), 0);
        assert!(session
            .fetch_all_keys(&TagFilter::any())
            .await
            .unwrap()
            .is_empty());
    }
}
