//! Store driver and session traits.
//!
//! A [`StoreDriver`] provisions, opens and deletes whole stores; a
//! [`StoreSession`] reads and writes one open store. Production drivers
//! wrap a platform encrypted database; tests use the in-memory driver.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{KeyEntry, KeyWrapScheme, PassKey, Record, StoreId, TagFilter};

/// Provisions and opens encrypted record stores.
///
/// Store I/O is potentially long-running (disk, platform crypto), so
/// every operation is async.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Creates a new store under `id` keyed by `pass_key`.
    ///
    /// The key-wrap scheme is fixed for the lifetime of the store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::AlreadyExists`] if a store is already
    /// provisioned under this identifier.
    async fn provision(
        &self,
        id: &StoreId,
        scheme: KeyWrapScheme,
        pass_key: &PassKey,
        profile: &str,
    ) -> StoreResult<Box<dyn StoreSession>>;

    /// Opens an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::NotFound`] if the store does not
    /// exist, [`crate::StoreError::SchemeMismatch`] if `scheme` differs
    /// from the provisioned one, and [`crate::StoreError::InvalidKey`]
    /// if `pass_key` fails the store's key check.
    async fn open(
        &self,
        id: &StoreId,
        scheme: KeyWrapScheme,
        pass_key: &PassKey,
        profile: &str,
    ) -> StoreResult<Box<dyn StoreSession>>;

    /// Whether a store is provisioned under `id`.
    async fn exists(&self, id: &StoreId) -> StoreResult<bool>;

    /// Deletes a store and all its contents.
    ///
    /// Deleting a store that does not exist is a no-op.
    async fn delete(&self, id: &StoreId) -> StoreResult<()>;
}

/// A handle on one open store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Fetches a single record by category and id.
    async fn fetch(&self, category: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Fetches all data records matching the filter.
    async fn fetch_all(&self, filter: &TagFilter) -> StoreResult<Vec<Record>>;

    /// Inserts a data record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::DuplicateRecord`] if a record with
    /// the same category and id exists.
    async fn insert(&mut self, record: Record) -> StoreResult<()>;

    /// Fetches all key-table entries matching the filter.
    async fn fetch_all_keys(&self, filter: &TagFilter) -> StoreResult<Vec<KeyEntry>>;

    /// Inserts a key-table entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::DuplicateKey`] if an entry with the
    /// same name exists.
    async fn insert_key(&mut self, entry: KeyEntry) -> StoreResult<()>;

    /// Removes a key-table entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::KeyNotFound`] if no entry has this
    /// name.
    async fn remove_key(&mut self, name: &str) -> StoreResult<()>;

    /// Closes the session. Further calls fail with
    /// [`crate::StoreError::SessionClosed`].
    async fn close(&mut self) -> StoreResult<()>;
}
