//! Wallet store migration.
//!
//! Re-keys an entire encrypted record store from a legacy key-wrap
//! scheme to a new one by provisioning a fresh store under a bumped
//! version and copying every data record and key-table entry across,
//! tags and metadata preserved.
//!
//! The engine never deletes the legacy store. On any copy failure the
//! partially written destination is dropped and the legacy store is
//! left intact, so the migration can simply be retried on the next
//! launch. Deleting legacy secrets after a successful migration is an
//! explicit, separate caller action.
//!
//! The engine expects exclusive access to both stores: the unlock
//! state machine must not be serving unlock operations while a
//! migration runs.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use idwallet_store::{
    KeyWrapScheme, StoreDriver, StoreError, StoreId, StoreSession, TagFilter,
};

use crate::wallet_key::WalletKeyMaterial;

/// Retry parameters for individual copy operations.
///
/// Explicit data rather than ambient state: callers decide how
/// aggressive a migration may be on their device class.
#[derive(Debug, Clone, Copy)]
pub struct MigrationBackoff {
    /// Attempts per record/key copy before the migration aborts.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per subsequent retry.
    pub base_delay: Duration,
}

impl Default for MigrationBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// One side of a migration: a store plus what opens it.
pub struct StoreRef<'a> {
    /// Store identifier.
    pub id: StoreId,
    /// The store's key-wrap scheme.
    pub scheme: KeyWrapScheme,
    /// The wallet key that opens it.
    pub key: &'a WalletKeyMaterial,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Data records copied into the destination.
    pub records_copied: usize,
    /// Key-table entries copied into the destination.
    pub keys_copied: usize,
    /// The destination already existed; nothing was copied.
    pub already_migrated: bool,
}

/// Errors from the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Source and destination resolve to the same store.
    #[error("migration source and destination are the same store: {0}")]
    SameStore(String),

    /// A store operation failed. The legacy store is untouched and the
    /// migration can be retried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Copies a legacy store into a freshly provisioned successor.
pub struct MigrationEngine<D> {
    driver: D,
    backoff: MigrationBackoff,
}

impl<D: StoreDriver> MigrationEngine<D> {
    /// Creates an engine over the given driver.
    #[must_use]
    pub const fn new(driver: D, backoff: MigrationBackoff) -> Self {
        Self { driver, backoff }
    }

    /// Migrates `legacy` into `destination`.
    ///
    /// Idempotent: if the destination store already exists the
    /// migration is treated as completed and nothing is copied.
    ///
    /// # Errors
    ///
    /// Any failure aborts the whole migration, removes the partially
    /// written destination, and leaves the legacy store intact.
    pub async fn migrate(
        &self,
        legacy: StoreRef<'_>,
        destination: StoreRef<'_>,
        profile: &str,
    ) -> Result<MigrationReport, MigrationError> {
        if legacy.id == destination.id {
            return Err(MigrationError::SameStore(legacy.id.to_string()));
        }

        // Destination scan before anything destructive can happen.
        if self.driver.exists(&destination.id).await? {
            info!(store = %destination.id, "destination already provisioned; migration is a no-op");
            return Ok(MigrationReport {
                records_copied: 0,
                keys_copied: 0,
                already_migrated: true,
            });
        }

        let mut legacy_session = self
            .driver
            .open(&legacy.id, legacy.scheme, &legacy.key.pass_key(), profile)
            .await?;

        let destination_session = self
            .driver
            .provision(
                &destination.id,
                destination.scheme,
                &destination.key.pass_key(),
                profile,
            )
            .await?;

        let outcome = self
            .copy_all(legacy_session.as_ref(), destination_session)
            .await;
        if let Err(err) = legacy_session.close().await {
            warn!(%err, "closing legacy session after migration");
        }

        match outcome {
            Ok(report) => {
                info!(
                    from = %legacy.id,
                    to = %destination.id,
                    records = report.records_copied,
                    keys = report.keys_copied,
                    "migration complete"
                );
                Ok(report)
            }
            Err(err) => {
                // Drop the partial destination so the next run starts
                // clean; the legacy store is never deleted here.
                warn!(from = %legacy.id, to = %destination.id, %err, "migration aborted");
                if let Err(cleanup) = self.driver.delete(&destination.id).await {
                    warn!(%cleanup, "failed to remove partial migration destination");
                }
                Err(err)
            }
        }
    }

    async fn copy_all(
        &self,
        legacy: &dyn StoreSession,
        mut destination: Box<dyn StoreSession>,
    ) -> Result<MigrationReport, MigrationError> {
        let records = legacy.fetch_all(&TagFilter::any()).await?;
        let keys = legacy.fetch_all_keys(&TagFilter::any()).await?;

        let mut records_copied = 0;
        for record in records {
            debug!(category = %record.category, id = %record.id, "copying record");
            self.insert_with_retries(destination.as_mut(), &CopyItem::Record(record))
                .await?;
            records_copied += 1;
        }

        let mut keys_copied = 0;
        for entry in keys {
            debug!(name = %entry.name, "copying key entry");
            self.insert_with_retries(destination.as_mut(), &CopyItem::Key(entry))
                .await?;
            keys_copied += 1;
        }

        destination.close().await?;

        Ok(MigrationReport {
            records_copied,
            keys_copied,
            already_migrated: false,
        })
    }

    /// Runs one copy operation under the configured backoff.
    async fn insert_with_retries(
        &self,
        destination: &mut dyn StoreSession,
        item: &CopyItem,
    ) -> Result<(), MigrationError> {
        let mut delay = self.backoff.base_delay;
        let mut attempt = 0u32;
        loop {
            let result = match item {
                CopyItem::Record(record) => destination.insert(record.clone()).await,
                CopyItem::Key(entry) => destination.insert_key(entry.clone()).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.backoff.max_retries => {
                    attempt += 1;
                    debug!(%err, attempt, "copy failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

enum CopyItem {
    Record(idwallet_store::Record),
    Key(idwallet_store::KeyEntry),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use idwallet_store::{KeyEntry, MemoryStoreDriver, PassKey, Record};

    fn raw_key(byte: u8) -> WalletKeyMaterial {
        WalletKeyMaterial::from_parts([byte; 32], KeyWrapScheme::Raw)
    }

    async fn seed_legacy(
        driver: &MemoryStoreDriver,
        id: &StoreId,
        key: &WalletKeyMaterial,
        records: usize,
        keys: usize,
    ) {
        let mut session = driver
            .provision(id, KeyWrapScheme::Raw, &key.pass_key(), "default")
            .await
            .unwrap();
        for i in 0..records {
            session
                .insert(
                    Record::with_cbor_value(format!("record-{i}"), "credential", &(i as u32))
                        .unwrap()
                        .with_tag("format", "sd-jwt"),
                )
                .await
                .unwrap();
        }
        for i in 0..keys {
            session
                .insert_key(KeyEntry {
                    name: format!("key-{i}"),
                    algorithm: "p256".into(),
                    public_key: vec![4; 65],
                    wrapped_secret: vec![1, 2, 3],
                    tags: [("backing".to_string(), "software".to_string())].into(),
                })
                .await
                .unwrap();
        }
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrate_copies_everything() {
        let driver = MemoryStoreDriver::new();
        let legacy_id = StoreId::new("idwallet", 1);
        let legacy_key = raw_key(1);
        let new_key = raw_key(2);
        seed_legacy(&driver, &legacy_id, &legacy_key, 4, 3).await;

        let engine = MigrationEngine::new(driver.clone(), MigrationBackoff::default());
        let report = engine
            .migrate(
                StoreRef {
                    id: legacy_id.clone(),
                    scheme: KeyWrapScheme::Raw,
                    key: &legacy_key,
                },
                StoreRef {
                    id: legacy_id.next_version(),
                    scheme: KeyWrapScheme::KdfDerived,
                    key: &new_key,
                },
                "default",
            )
            .await
            .unwrap();

        assert_eq!(report.records_copied, 4);
        assert_eq!(report.keys_copied, 3);
        assert!(!report.already_migrated);

        // Destination contents match, tags preserved.
        let session = driver
            .open(
                &legacy_id.next_version(),
                KeyWrapScheme::KdfDerived,
                &new_key.pass_key(),
                "default",
            )
            .await
            .unwrap();
        let records = session.fetch_all(&TagFilter::any()).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.tags["format"] == "sd-jwt"));
        let keys = session.fetch_all_keys(&TagFilter::any()).await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.tags["backing"] == "software"));

        // Legacy store is still there.
        assert!(driver.exists(&legacy_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let driver = MemoryStoreDriver::new();
        let legacy_id = StoreId::new("idwallet", 1);
        let legacy_key = raw_key(1);
        let new_key = raw_key(2);
        seed_legacy(&driver, &legacy_id, &legacy_key, 2, 1).await;

        let engine = MigrationEngine::new(driver.clone(), MigrationBackoff::default());
        let legacy_ref = || StoreRef {
            id: legacy_id.clone(),
            scheme: KeyWrapScheme::Raw,
            key: &legacy_key,
        };
        let destination_ref = || StoreRef {
            id: legacy_id.next_version(),
            scheme: KeyWrapScheme::KdfDerived,
            key: &new_key,
        };

        let first = engine
            .migrate(legacy_ref(), destination_ref(), "default")
            .await
            .unwrap();
        assert_eq!(first.records_copied, 2);

        let second = engine
            .migrate(legacy_ref(), destination_ref(), "default")
            .await
            .unwrap();
        assert!(second.already_migrated);
        assert_eq!(second.records_copied, 0);

        // Still exactly the original contents.
        let session = driver
            .open(
                &legacy_id.next_version(),
                KeyWrapScheme::KdfDerived,
                &new_key.pass_key(),
                "default",
            )
            .await
            .unwrap();
        assert_eq!(session.fetch_all(&TagFilter::any()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_same_store_rejected() {
        let driver = MemoryStoreDriver::new();
        let id = StoreId::new("idwallet", 1);
        let key = raw_key(1);
        seed_legacy(&driver, &id, &key, 1, 0).await;

        let engine = MigrationEngine::new(driver, MigrationBackoff::default());
        let result = engine
            .migrate(
                StoreRef {
                    id: id.clone(),
                    scheme: KeyWrapScheme::Raw,
                    key: &key,
                },
                StoreRef {
                    id,
                    scheme: KeyWrapScheme::Raw,
                    key: &key,
                },
                "default",
            )
            .await;
        assert!(matches!(result, Err(MigrationError::SameStore(_))));
    }

    /// A driver whose freshly provisioned sessions fail every insert,
    /// to exercise the abort path.
    #[derive(Clone)]
    struct FailingInsertDriver {
        inner: MemoryStoreDriver,
    }

    struct FailingSession {
        inner: Box<dyn StoreSession>,
        fail: bool,
    }

    #[async_trait]
    impl StoreDriver for FailingInsertDriver {
        async fn provision(
            &self,
            id: &StoreId,
            scheme: KeyWrapScheme,
            pass_key: &PassKey,
            profile: &str,
        ) -> idwallet_store::StoreResult<Box<dyn StoreSession>> {
            let inner = self.inner.provision(id, scheme, pass_key, profile).await?;
            Ok(Box::new(FailingSession { inner, fail: true }))
        }

        async fn open(
            &self,
            id: &StoreId,
            scheme: KeyWrapScheme,
            pass_key: &PassKey,
            profile: &str,
        ) -> idwallet_store::StoreResult<Box<dyn StoreSession>> {
            let inner = self.inner.open(id, scheme, pass_key, profile).await?;
            Ok(Box::new(FailingSession { inner, fail: false }))
        }

        async fn exists(&self, id: &StoreId) -> idwallet_store::StoreResult<bool> {
            self.inner.exists(id).await
        }

        async fn delete(&self, id: &StoreId) -> idwallet_store::StoreResult<()> {
            self.inner.delete(id).await
        }
    }

    #[async_trait]
    impl StoreSession for FailingSession {
        async fn fetch(
            &self,
            category: &str,
            id: &str,
        ) -> idwallet_store::StoreResult<Option<Record>> {
            self.inner.fetch(category, id).await
        }

        async fn fetch_all(
            &self,
            filter: &TagFilter,
        ) -> idwallet_store::StoreResult<Vec<Record>> {
            self.inner.fetch_all(filter).await
        }

        async fn insert(&mut self, record: Record) -> idwallet_store::StoreResult<()> {
            if self.fail {
                return Err(StoreError::Backend("simulated write failure".into()));
            }
            self.inner.insert(record).await
        }

        async fn fetch_all_keys(
            &self,
            filter: &TagFilter,
        ) -> idwallet_store::StoreResult<Vec<KeyEntry>> {
            self.inner.fetch_all_keys(filter).await
        }

        async fn insert_key(&mut self, entry: KeyEntry) -> idwallet_store::StoreResult<()> {
            if self.fail {
                return Err(StoreError::Backend("simulated write failure".into()));
            }
            self.inner.insert_key(entry).await
        }

        async fn remove_key(&mut self, name: &str) -> idwallet_store::StoreResult<()> {
            self.inner.remove_key(name).await
        }

        async fn close(&mut self) -> idwallet_store::StoreResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_legacy_intact_and_is_retryable() {
        let memory = MemoryStoreDriver::new();
        let legacy_id = StoreId::new("idwallet", 1);
        let legacy_key = raw_key(1);
        let new_key = raw_key(2);
        seed_legacy(&memory, &legacy_id, &legacy_key, 3, 1).await;

        let failing = FailingInsertDriver {
            inner: memory.clone(),
        };
        let engine = MigrationEngine::new(
            failing,
            MigrationBackoff {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
            },
        );

        let result = engine
            .migrate(
                StoreRef {
                    id: legacy_id.clone(),
                    scheme: KeyWrapScheme::Raw,
                    key: &legacy_key,
                },
                StoreRef {
                    id: legacy_id.next_version(),
                    scheme: KeyWrapScheme::KdfDerived,
                    key: &new_key,
                },
                "default",
            )
            .await;
        assert!(matches!(result, Err(MigrationError::Store(_))));

        // Legacy untouched, partial destination cleaned up.
        assert!(memory.exists(&legacy_id).await.unwrap());
        assert!(!memory.exists(&legacy_id.next_version()).await.unwrap());

        // Retry with a healthy driver succeeds.
        let engine = MigrationEngine::new(memory.clone(), MigrationBackoff::default());
        let report = engine
            .migrate(
                StoreRef {
                    id: legacy_id.clone(),
                    scheme: KeyWrapScheme::Raw,
                    key: &legacy_key,
                },
                StoreRef {
                    id: legacy_id.next_version(),
                    scheme: KeyWrapScheme::KdfDerived,
                    key: &new_key,
                },
                "default",
            )
            .await
            .unwrap();
        assert_eq!(report.records_copied, 3);
        assert_eq!(report.keys_copied, 1);
    }
}
