//! Secure-unlock state machine.
//!
//! All wallet access is gated here. The machine acquires the wallet key
//! from the OS secret store (biometric path) or derives it from a PIN
//! (KDF path), opens the encrypted record store with it, and hands out
//! an explicit [`WalletHandle`] — there is no ambient global wallet.
//!
//! # States
//!
//! ```text
//! NotConfigured ──configure──► Unlocked
//!       ▲                        │ lock
//!       │ reset                  ▼
//!       └───────────────────── Locked ──pin/biometrics──► AcquiredWalletKey
//!                                │  ▲                          │
//!                                │  └──── key rejected ────────┤
//!                                │        (attempt_count + 1)  ▼
//!                          PinLocked ◄── limit reached     Unlocked
//! ```
//!
//! `AcquiredWalletKey` and `Initializing` are transitional and
//! observable while a store open or provisioning is in flight.
//!
//! # Concurrency
//!
//! Exactly one unlock/lock/reset operation may be in flight per
//! machine. Re-entrant calls are rejected deterministically with
//! [`UnlockError::OperationInProgress`]; they are not queued.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info, warn};

use idwallet_store::{KeyWrapScheme, StoreDriver, StoreError, StoreId, StoreSession};

use crate::crypto::{CryptoError, KdfEngine, KdfParams};
use crate::keystore::{BiometryType, KeystoreError, SecureKeystore};
use crate::wallet_key::{WalletKeyMaterial, WalletKeyStore};

/// Unlock policy and store addressing.
#[derive(Debug, Clone)]
pub struct UnlockConfig {
    /// Product prefix for store and keystore identifiers.
    pub product: String,
    /// Active wallet store version.
    pub store_version: u32,
    /// Store profile name passed to the driver.
    pub profile: String,
    /// Failed PIN attempts before the terminal `PinLocked` state.
    /// A product policy value, not a protocol constant.
    pub max_attempts: u32,
    /// KDF cost parameters for PIN-derived wallet keys.
    pub kdf: KdfParams,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            product: "idwallet".into(),
            store_version: 1,
            profile: "default".into(),
            max_attempts: 5,
            kdf: KdfParams::default(),
        }
    }
}

/// An unlocked wallet: the open store session plus its identity.
///
/// Handed out by successful unlock operations and threaded explicitly
/// through everything that needs wallet access.
pub struct WalletHandle {
    store_id: StoreId,
    session: tokio::sync::Mutex<Box<dyn StoreSession>>,
}

impl WalletHandle {
    fn new(store_id: StoreId, session: Box<dyn StoreSession>) -> Self {
        Self {
            store_id,
            session: tokio::sync::Mutex::new(session),
        }
    }

    /// The identifier of the open store.
    #[must_use]
    pub const fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Locks and returns the underlying store session.
    pub async fn session(&self) -> tokio::sync::MutexGuard<'_, Box<dyn StoreSession>> {
        self.session.lock().await
    }
}

impl fmt::Debug for WalletHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletHandle")
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

/// Observable unlock state. Owned by the machine; the UI reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockState {
    /// No wallet exists yet; `configure` is required.
    NotConfigured,
    /// Wallet exists and is locked.
    Locked {
        /// Consecutive failed unlock attempts since the last success.
        attempt_count: u32,
        /// Whether the biometric path is currently offered.
        can_use_biometrics: bool,
    },
    /// A candidate wallet key has been acquired; the store open is in
    /// flight. The key itself is not part of the observable state.
    AcquiredWalletKey,
    /// Store provisioning or other long-running setup is in flight.
    Initializing,
    /// The wallet is open.
    Unlocked,
    /// Terminal: the attempt limit was exceeded. Only `reset` leaves
    /// this state.
    PinLocked,
    /// Unrecoverable failure outside the normal taxonomy.
    Error {
        /// Human-readable description.
        reason: String,
    },
}

/// Errors from unlock operations. Match exhaustively; every variant has
/// a defined recovery.
#[derive(Debug, Error)]
pub enum UnlockError {
    /// No wallet is configured.
    #[error("wallet not configured")]
    NotConfigured,

    /// A wallet is already configured.
    #[error("wallet already configured")]
    AlreadyConfigured,

    /// The operation is not valid in the current state.
    #[error("operation {operation} invalid in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state it was attempted in.
        state: &'static str,
    },

    /// Another unlock/lock/reset operation is in flight.
    #[error("another unlock operation is in progress")]
    OperationInProgress,

    /// The store rejected the wallet key (wrong PIN). The attempt
    /// counter has been incremented.
    #[error("invalid wallet key; {attempts_remaining} attempts remaining")]
    InvalidWalletKey {
        /// Attempts left before the terminal lockout.
        attempts_remaining: u32,
    },

    /// The attempt limit is exhausted; a full wallet reset is required.
    #[error("wallet is pin-locked; reset required")]
    PinLocked,

    /// The user dismissed the biometric prompt. No penalty.
    #[error("user cancelled authentication")]
    UserCancelled,

    /// Biometry is not usable right now. No penalty.
    #[error("biometric authentication unavailable")]
    BiometricUnavailable,

    /// KDF or cipher failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Platform keystore failure other than the prompt outcomes.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Record-store failure other than a key rejection.
    #[error(transparent)]
    Store(StoreError),
}

impl From<KeystoreError> for UnlockError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::UserCancelled => Self::UserCancelled,
            KeystoreError::BiometricUnavailable => Self::BiometricUnavailable,
            KeystoreError::Backend(message) => Self::Keystore(message),
        }
    }
}

struct Inner {
    state: UnlockState,
    handle: Option<Arc<WalletHandle>>,
}

/// The secure-unlock state machine.
pub struct SecureUnlockMachine {
    config: UnlockConfig,
    kdf: KdfEngine,
    driver: Arc<dyn StoreDriver>,
    key_store: WalletKeyStore,
    keystore: Arc<dyn SecureKeystore>,
    inner: StdMutex<Inner>,
    op: tokio::sync::Mutex<()>,
}

impl SecureUnlockMachine {
    /// Creates a machine in the `NotConfigured` state. Call
    /// [`Self::initialize`] to discover persisted wallet state.
    #[must_use]
    pub fn new(
        config: UnlockConfig,
        keystore: Arc<dyn SecureKeystore>,
        driver: Arc<dyn StoreDriver>,
    ) -> Self {
        let key_store = WalletKeyStore::new(Arc::clone(&keystore), config.product.clone());
        let kdf = KdfEngine::new(config.kdf);
        Self {
            config,
            kdf,
            driver,
            key_store,
            keystore,
            inner: StdMutex::new(Inner {
                state: UnlockState::NotConfigured,
                handle: None,
            }),
            op: tokio::sync::Mutex::new(()),
        }
    }

    /// The machine's configuration.
    #[must_use]
    pub const fn config(&self) -> &UnlockConfig {
        &self.config
    }

    /// The current observable state.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    #[must_use]
    pub fn state(&self) -> UnlockState {
        self.inner.lock().expect("state poisoned").state.clone()
    }

    /// The active wallet handle, if the wallet is unlocked.
    #[must_use]
    pub fn handle(&self) -> Option<Arc<WalletHandle>> {
        self.inner.lock().expect("state poisoned").handle.clone()
    }

    fn store_id(&self) -> StoreId {
        StoreId::new(self.config.product.clone(), self.config.store_version)
    }

    fn can_use_biometrics(&self) -> bool {
        self.keystore.biometry_type() != BiometryType::Unavailable
    }

    fn set_state(&self, state: UnlockState) {
        debug!(?state, "unlock state transition");
        self.inner.lock().expect("state poisoned").state = state;
    }

    fn set_unlocked(&self, handle: Arc<WalletHandle>) {
        let mut inner = self.inner.lock().expect("state poisoned");
        inner.state = UnlockState::Unlocked;
        inner.handle = Some(handle);
    }

    fn take_handle(&self) -> Option<Arc<WalletHandle>> {
        self.inner.lock().expect("state poisoned").handle.take()
    }

    fn attempt_count(&self) -> u32 {
        match self.inner.lock().expect("state poisoned").state {
            UnlockState::Locked { attempt_count, .. } => attempt_count,
            _ => 0,
        }
    }

    /// Discovers persisted wallet state: `Locked` if a wallet was
    /// configured on this device, `NotConfigured` otherwise.
    ///
    /// # Errors
    ///
    /// Rejects re-entrant calls and surfaces keystore backend failures.
    pub async fn initialize(&self) -> Result<UnlockState, UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;

        // Salt presence is the configuration marker: it is written at
        // configure time and readable without a prompt.
        let configured = self
            .key_store
            .get_salt(self.config.store_version)
            .await?
            .is_some();

        let state = if configured {
            UnlockState::Locked {
                attempt_count: 0,
                can_use_biometrics: self.can_use_biometrics(),
            }
        } else {
            UnlockState::NotConfigured
        };
        self.set_state(state.clone());
        Ok(state)
    }

    /// Creates the wallet: derives the wallet key from `pin`,
    /// provisions the record store, and stores key and salt in the OS
    /// secret store. Ends `Unlocked`.
    ///
    /// Atomic from the caller's point of view: if any step after
    /// provisioning fails, the half-provisioned store and any partially
    /// written keystore items are removed and the machine returns to
    /// `NotConfigured`, so `configure` can simply be retried.
    ///
    /// # Errors
    ///
    /// Fails with [`UnlockError::AlreadyConfigured`] if a wallet
    /// exists, and propagates KDF, keystore and store failures.
    pub async fn configure(&self, pin: &SecretString) -> Result<Arc<WalletHandle>, UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;

        if self.state() != UnlockState::NotConfigured {
            return Err(UnlockError::AlreadyConfigured);
        }

        let salt = crate::crypto::generate_salt();
        let derived = self.kdf.derive(pin.expose_secret().as_bytes(), &salt)?;
        let material = WalletKeyMaterial::from_kdf(derived);

        self.set_state(UnlockState::Initializing);

        let store_id = self.store_id();
        let mut session = match self
            .driver
            .provision(
                &store_id,
                KeyWrapScheme::KdfDerived,
                &material.pass_key(),
                &self.config.profile,
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.set_state(UnlockState::Error {
                    reason: err.to_string(),
                });
                return Err(UnlockError::Store(err));
            }
        };

        // Mirror the salt as the store's well-known salt record, then
        // persist salt and key in the OS secret store.
        let setup = async {
            crate::wallet_key::ensure_salt_record(session.as_mut(), &salt)
                .await
                .map_err(UnlockError::Store)?;
            self.key_store
                .put_salt(self.config.store_version, &salt)
                .await?;
            self.key_store
                .put(self.config.store_version, &material)
                .await?;
            Ok::<(), UnlockError>(())
        };
        if let Err(err) = setup.await {
            // Roll back so a retry starts from a clean slate. The store
            // was provisioned moments ago and the wallet key was never
            // handed out.
            warn!(%err, "wallet setup failed; rolling back configuration");
            let _ = session.close().await;
            if let Err(cleanup) = self.driver.delete(&store_id).await {
                warn!(%cleanup, "failed to remove half-provisioned store");
            }
            if let Err(cleanup) = self.key_store.remove(self.config.store_version).await {
                warn!(%cleanup, "failed to remove partial keystore items");
            }
            self.set_state(UnlockState::NotConfigured);
            return Err(err);
        }

        let handle = Arc::new(WalletHandle::new(store_id, session));
        self.set_unlocked(Arc::clone(&handle));
        info!(version = self.config.store_version, "wallet configured");
        Ok(handle)
    }

    /// Unlocks with a PIN: re-derives the wallet key and opens the
    /// store with it.
    ///
    /// A key rejection increments the attempt counter; exceeding
    /// `max_attempts` transitions to the terminal `PinLocked` state.
    /// A successful unlock resets the counter to zero.
    ///
    /// # Errors
    ///
    /// See [`UnlockError`]; the state after each failure is defined in
    /// the module docs.
    pub async fn unlock_with_pin(
        &self,
        pin: &SecretString,
    ) -> Result<Arc<WalletHandle>, UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;
        self.ensure_locked("unlock_with_pin")?;

        let salt = self
            .key_store
            .get_salt(self.config.store_version)
            .await?
            .ok_or(UnlockError::NotConfigured)?;
        let derived = self.kdf.derive(pin.expose_secret().as_bytes(), &salt)?;
        let material = WalletKeyMaterial::from_kdf(derived);

        self.open_with_key(material).await
    }

    /// Unlocks with the wallet key held in the OS secret store, behind
    /// the platform's biometric prompt.
    ///
    /// Only valid in `Locked` with biometrics offered. A cancelled or
    /// unavailable prompt returns to `Locked` without penalty.
    ///
    /// # Errors
    ///
    /// See [`UnlockError`].
    pub async fn try_unlock_with_biometrics(&self) -> Result<Arc<WalletHandle>, UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;
        self.ensure_locked("try_unlock_with_biometrics")?;

        if !self.can_use_biometrics() {
            return Err(UnlockError::BiometricUnavailable);
        }

        // Suspends for the OS prompt. Cancel / unavailable map straight
        // through and leave the state untouched.
        let material = self
            .key_store
            .get(self.config.store_version)
            .await?
            .ok_or(UnlockError::NotConfigured)?;

        self.open_with_key(material).await
    }

    /// Locks the wallet: closes the store session, discards the
    /// in-memory key material, returns to `Locked`.
    ///
    /// # Errors
    ///
    /// Only valid from `Unlocked`.
    pub async fn lock(&self) -> Result<(), UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;

        if self.state() != UnlockState::Unlocked {
            return Err(UnlockError::InvalidState {
                operation: "lock",
                state: state_name(&self.state()),
            });
        }

        if let Some(handle) = self.take_handle() {
            let mut session = handle.session().await;
            if let Err(err) = session.close().await {
                warn!(%err, "closing store session on lock");
            }
        }

        self.set_state(UnlockState::Locked {
            attempt_count: 0,
            can_use_biometrics: self.can_use_biometrics(),
        });
        info!("wallet locked");
        Ok(())
    }

    /// Full wallet reset: wipes stored key material and deletes the
    /// record store. Valid from any state, including `PinLocked`.
    ///
    /// # Errors
    ///
    /// Propagates keystore and store-driver failures; the machine ends
    /// `NotConfigured` regardless of the prior state.
    pub async fn reset(&self) -> Result<(), UnlockError> {
        let _guard = self
            .op
            .try_lock()
            .map_err(|_| UnlockError::OperationInProgress)?;

        if let Some(handle) = self.take_handle() {
            let mut session = handle.session().await;
            let _ = session.close().await;
        }

        self.driver
            .delete(&self.store_id())
            .await
            .map_err(UnlockError::Store)?;
        self.key_store.remove(self.config.store_version).await?;

        self.set_state(UnlockState::NotConfigured);
        info!("wallet reset");
        Ok(())
    }

    fn ensure_locked(&self, operation: &'static str) -> Result<(), UnlockError> {
        match self.state() {
            UnlockState::Locked { .. } => Ok(()),
            UnlockState::PinLocked => Err(UnlockError::PinLocked),
            UnlockState::NotConfigured => Err(UnlockError::NotConfigured),
            other => Err(UnlockError::InvalidState {
                operation,
                state: state_name(&other),
            }),
        }
    }

    /// Opens the store with an acquired key and settles the state
    /// machine: `Unlocked` on success, attempt accounting on a key
    /// rejection.
    async fn open_with_key(
        &self,
        material: WalletKeyMaterial,
    ) -> Result<Arc<WalletHandle>, UnlockError> {
        let attempts_before = self.attempt_count();
        self.set_state(UnlockState::AcquiredWalletKey);

        let store_id = self.store_id();
        match self
            .driver
            .open(
                &store_id,
                material.scheme(),
                &material.pass_key(),
                &self.config.profile,
            )
            .await
        {
            Ok(session) => {
                let handle = Arc::new(WalletHandle::new(store_id, session));
                self.set_unlocked(Arc::clone(&handle));
                info!("wallet unlocked");
                Ok(handle)
            }
            Err(StoreError::InvalidKey(_)) => {
                let attempt_count = attempts_before + 1;
                if attempt_count >= self.config.max_attempts {
                    self.set_state(UnlockState::PinLocked);
                    warn!(attempt_count, "attempt limit reached; wallet pin-locked");
                    Err(UnlockError::PinLocked)
                } else {
                    self.set_state(UnlockState::Locked {
                        attempt_count,
                        can_use_biometrics: self.can_use_biometrics(),
                    });
                    Err(UnlockError::InvalidWalletKey {
                        attempts_remaining: self.config.max_attempts - attempt_count,
                    })
                }
            }
            Err(err) => {
                self.set_state(UnlockState::Error {
                    reason: err.to_string(),
                });
                Err(UnlockError::Store(err))
            }
        }
    }
}

const fn state_name(state: &UnlockState) -> &'static str {
    match state {
        UnlockState::NotConfigured => "not-configured",
        UnlockState::Locked { .. } => "locked",
        UnlockState::AcquiredWalletKey => "acquired-wallet-key",
        UnlockState::Initializing => "initializing",
        UnlockState::Unlocked => "unlocked",
        UnlockState::PinLocked => "pin-locked",
        UnlockState::Error { .. } => "error",
    }
}
